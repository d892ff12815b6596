//! Telemetry data sender
//!
//! Streams collected signals into payload chunks, cutting a chunk whenever
//! the writer's estimated size crosses the transmit threshold. Payloads that
//! still exceed the wire limit after serialization are split in half and
//! retried, at most twice (halves, then quarters), then dropped. After each
//! successful upload the threshold adapts toward the configured payload
//! size corridor.

use crate::payload::PayloadWriter;
use crate::sender::Sender;
use parking_lot::Mutex;
use roadcast_core::collection::TriggeredCollectionSchemeData;
use std::io::Write;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{trace, warn};

/// Times a payload may be split in half before it is dropped.
pub const UPLOAD_PROTO_RECURSION_LIMIT: u32 = 2;

/// Completion callback for one processed data item.
pub type OnDataProcessedCallback = Box<dyn FnOnce(bool) + Send>;

/// Transmit threshold adaptation parameters, one instance per compression
/// mode. The threshold itself is derived from the sender's maximum payload
/// size at construction.
#[derive(Clone, Copy, Debug, Default)]
pub struct PayloadAdaptionConfig {
    pub transmit_threshold_start_percent: u32,
    pub payload_size_limit_min_percent: u32,
    pub payload_size_limit_max_percent: u32,
    pub transmit_threshold_adapt_percent: u32,
    pub transmit_size_threshold: usize,
}

impl PayloadAdaptionConfig {
    pub fn new(
        transmit_threshold_start_percent: u32,
        payload_size_limit_min_percent: u32,
        payload_size_limit_max_percent: u32,
        transmit_threshold_adapt_percent: u32,
    ) -> Self {
        Self {
            transmit_threshold_start_percent,
            payload_size_limit_min_percent,
            payload_size_limit_max_percent,
            transmit_threshold_adapt_percent,
            transmit_size_threshold: 0,
        }
    }
}

struct AdaptionState {
    uncompressed: PayloadAdaptionConfig,
    compressed: PayloadAdaptionConfig,
}

impl AdaptionState {
    fn config_mut(&mut self, compress: bool) -> &mut PayloadAdaptionConfig {
        if compress {
            &mut self.compressed
        } else {
            &mut self.uncompressed
        }
    }
}

pub struct TelemetryDataSender {
    sender: Arc<dyn Sender>,
    topic: String,
    state: Mutex<AdaptionState>,
}

impl TelemetryDataSender {
    pub fn new(
        sender: Arc<dyn Sender>,
        topic: impl Into<String>,
        mut config_uncompressed: PayloadAdaptionConfig,
        mut config_compressed: PayloadAdaptionConfig,
    ) -> Self {
        let max_send_size = sender.get_max_send_size();
        config_uncompressed.transmit_size_threshold =
            max_send_size * config_uncompressed.transmit_threshold_start_percent as usize / 100;
        config_compressed.transmit_size_threshold =
            max_send_size * config_compressed.transmit_threshold_start_percent as usize / 100;
        Self {
            sender,
            topic: topic.into(),
            state: Mutex::new(AdaptionState {
                uncompressed: config_uncompressed,
                compressed: config_compressed,
            }),
        }
    }

    /// Current transmit threshold for the given compression mode.
    pub fn transmit_size_threshold(&self, compress: bool) -> usize {
        self.state.lock().config_mut(compress).transmit_size_threshold
    }

    /// Serialize, chunk, and upload one triggered collection event. The
    /// callback fires once with the aggregate result.
    pub fn process_data(
        &self,
        data: &TriggeredCollectionSchemeData,
        on_done: OnDataProcessedCallback,
    ) {
        let compress = data.metadata.compress;
        let mut writer = PayloadWriter::new();
        writer.setup(data, data.event_id);

        let mut all_ok = true;
        for signal in &data.signals {
            writer.append_signal(signal.clone());
            let threshold = self.transmit_size_threshold(compress);
            if writer.estimated_size() >= threshold {
                let chunk = std::mem::take(&mut writer);
                all_ok &= self.upload_proto(chunk, compress, 0);
                writer.setup(data, data.event_id);
            }
        }
        if let Some(dtcs) = &data.active_dtcs {
            for code in &dtcs.codes {
                writer.append_dtc(code);
            }
        }
        if writer.signal_count() > 0 || writer.dtc_count() > 0 {
            all_ok &= self.upload_proto(writer, compress, 0);
        }
        on_done(all_ok);
    }

    /// Upload a record that was serialized when it was spooled to disk. The
    /// callback fires once the sender confirms or rejects the transfer.
    pub fn process_serialized_data(&self, data: Vec<u8>, on_done: OnDataProcessedCallback) {
        if data.len() > self.sender.get_max_send_size() {
            warn!(
                len = data.len(),
                "Dropping stored payload larger than maximum send size"
            );
            on_done(false);
            return;
        }
        self.sender
            .send_buffer(&self.topic, &data, Box::new(move |result| on_done(result.is_ok())));
    }

    /// Serialize (and optionally compress) the writer's content and send it.
    /// Oversized payloads are split in half and retried up to
    /// [`UPLOAD_PROTO_RECURSION_LIMIT`] levels deep.
    fn upload_proto(&self, writer: PayloadWriter, compress: bool, recursion_level: u32) -> bool {
        let serialized = match writer.serialize() {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "Failed to serialize payload");
                return false;
            }
        };
        let payload = if compress {
            match gzip(&serialized) {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(%error, "Failed to compress payload");
                    return false;
                }
            }
        } else {
            serialized
        };

        let max_send_size = self.sender.get_max_send_size();
        if payload.len() > max_send_size {
            if recursion_level >= UPLOAD_PROTO_RECURSION_LIMIT {
                warn!(
                    len = payload.len(),
                    max_send_size, "Dropping payload still too large after splitting"
                );
                return false;
            }
            let mut first = writer;
            let second = first.split_half();
            let first_ok = self.upload_proto(first, compress, recursion_level + 1);
            let second_ok = self.upload_proto(second, compress, recursion_level + 1);
            return first_ok && second_ok;
        }

        let (result_tx, result_rx) = mpsc::channel();
        self.sender.send_buffer(
            &self.topic,
            &payload,
            Box::new(move |result| {
                let _ = result_tx.send(result);
            }),
        );
        match result_rx.recv() {
            Ok(Ok(())) => {
                self.adapt_threshold(compress, payload.len());
                true
            }
            Ok(Err(error)) => {
                warn!(%error, "Upload failed");
                false
            }
            Err(_) => {
                warn!("Sender dropped its completion callback");
                false
            }
        }
    }

    fn adapt_threshold(&self, compress: bool, payload_size: usize) {
        let max_send_size = self.sender.get_max_send_size();
        let mut state = self.state.lock();
        let config = state.config_mut(compress);
        let min_limit = max_send_size * config.payload_size_limit_min_percent as usize / 100;
        let max_limit = max_send_size * config.payload_size_limit_max_percent as usize / 100;
        let adapt = config.transmit_threshold_adapt_percent as usize;
        if payload_size > 0 && payload_size < min_limit {
            config.transmit_size_threshold = config.transmit_size_threshold * (100 + adapt) / 100;
            trace!(
                payload_size,
                min_limit,
                threshold = config.transmit_size_threshold,
                "Payload below minimum limit, raising transmit threshold"
            );
        } else if payload_size > max_limit {
            config.transmit_size_threshold = config.transmit_size_threshold * (100 - adapt) / 100;
            trace!(
                payload_size,
                max_limit,
                threshold = config.transmit_size_threshold,
                "Payload above maximum limit, lowering transmit threshold"
            );
        }
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
