//! Upload payload envelope and chunk writer
//!
//! One envelope carries the signals of one collection event (identified by
//! its event ID) for one upload chunk. The writer tracks an estimated
//! serialized size so the telemetry sender can cut a chunk before it grows
//! past the transmit threshold, and supports splitting the buffered signals
//! in half when a serialized payload exceeds the sender's limit.

use roadcast_core::collection::{CollectedSignal, EventId, TriggeredCollectionSchemeData};
use roadcast_core::signal::SignalValue;
use roadcast_core::time::Timestamp;
use serde::{Deserialize, Serialize};

/// Wire envelope of one upload chunk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    pub event_id: EventId,
    pub collection_scheme_id: String,
    pub decoder_id: String,
    pub trigger_time: Timestamp,
    pub signals: Vec<CollectedSignal>,
    pub active_dtcs: Vec<String>,
}

impl TelemetryEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

// Rough per-item serialized sizes used for the running estimate; varint
// encoding makes the real size smaller.
const ENVELOPE_BASE_SIZE: usize = 32;
const SIGNAL_BASE_SIZE: usize = 20;

/// Incrementally filled envelope with a running size estimate.
#[derive(Clone, Debug, Default)]
pub struct PayloadWriter {
    envelope: TelemetryEnvelope,
    estimated_size: usize,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the writer for the next chunk of one collection event.
    pub fn setup(&mut self, data: &TriggeredCollectionSchemeData, event_id: EventId) {
        self.envelope = TelemetryEnvelope {
            event_id,
            collection_scheme_id: data.metadata.collection_scheme_id.clone(),
            decoder_id: data.metadata.decoder_id.clone(),
            trigger_time: data.trigger_time,
            signals: Vec::new(),
            active_dtcs: Vec::new(),
        };
        self.estimated_size = ENVELOPE_BASE_SIZE
            + self.envelope.collection_scheme_id.len()
            + self.envelope.decoder_id.len();
    }

    pub fn append_signal(&mut self, signal: CollectedSignal) {
        self.estimated_size += SIGNAL_BASE_SIZE
            + match &signal.value {
                SignalValue::String(bytes) => bytes.len(),
                _ => 8,
            };
        self.envelope.signals.push(signal);
    }

    pub fn append_dtc(&mut self, code: &str) {
        self.estimated_size += code.len() + 2;
        self.envelope.active_dtcs.push(code.to_string());
    }

    pub fn estimated_size(&self) -> usize {
        self.estimated_size
    }

    pub fn signal_count(&self) -> usize {
        self.envelope.signals.len()
    }

    pub fn dtc_count(&self) -> usize {
        self.envelope.active_dtcs.len()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, postcard::Error> {
        self.envelope.to_bytes()
    }

    /// Split the buffered signals in half, keeping the first half here and
    /// returning a writer holding the second half under the same header.
    pub fn split_half(&mut self) -> PayloadWriter {
        let half = self.envelope.signals.len() / 2;
        let tail = self.envelope.signals.split_off(half);
        let mut other = PayloadWriter {
            envelope: TelemetryEnvelope {
                event_id: self.envelope.event_id,
                collection_scheme_id: self.envelope.collection_scheme_id.clone(),
                decoder_id: self.envelope.decoder_id.clone(),
                trigger_time: self.envelope.trigger_time,
                signals: tail,
                active_dtcs: std::mem::take(&mut self.envelope.active_dtcs),
            },
            estimated_size: 0,
        };
        self.recompute_estimate();
        other.recompute_estimate();
        other
    }

    fn recompute_estimate(&mut self) {
        self.estimated_size = ENVELOPE_BASE_SIZE
            + self.envelope.collection_scheme_id.len()
            + self.envelope.decoder_id.len()
            + self
                .envelope
                .signals
                .iter()
                .map(|s| {
                    SIGNAL_BASE_SIZE
                        + match &s.value {
                            SignalValue::String(bytes) => bytes.len(),
                            _ => 8,
                        }
                })
                .sum::<usize>()
            + self
                .envelope
                .active_dtcs
                .iter()
                .map(|c| c.len() + 2)
                .sum::<usize>();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roadcast_core::collection::PassThroughMetadata;

    fn triggered(scheme_id: &str) -> TriggeredCollectionSchemeData {
        TriggeredCollectionSchemeData {
            metadata: PassThroughMetadata {
                collection_scheme_id: scheme_id.into(),
                decoder_id: "dm-1".into(),
                ..Default::default()
            },
            event_id: 1234,
            trigger_time: 5000,
            ..Default::default()
        }
    }

    fn sample(signal_id: u32) -> CollectedSignal {
        CollectedSignal {
            signal_id,
            receive_time: 5000,
            value: SignalValue::F64(1.5),
        }
    }

    #[test]
    fn test_round_trip() {
        let mut writer = PayloadWriter::new();
        writer.setup(&triggered("scheme-1"), 42);
        writer.append_signal(sample(1));
        writer.append_signal(sample(2));
        writer.append_dtc("P0143");

        let bytes = writer.serialize().unwrap();
        let envelope = TelemetryEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(envelope.event_id, 42);
        assert_eq!(envelope.signals.len(), 2);
        assert_eq!(envelope.active_dtcs, vec!["P0143"]);
    }

    #[test]
    fn test_estimate_grows_with_appends() {
        let mut writer = PayloadWriter::new();
        writer.setup(&triggered("scheme-1"), 1);
        let before = writer.estimated_size();
        writer.append_signal(sample(1));
        assert!(writer.estimated_size() > before);
    }

    #[test]
    fn test_split_half_preserves_order_and_header() {
        let mut writer = PayloadWriter::new();
        writer.setup(&triggered("scheme-1"), 7);
        for id in 0..10 {
            writer.append_signal(sample(id));
        }
        let tail = writer.split_half();
        assert_eq!(writer.signal_count(), 5);
        assert_eq!(tail.signal_count(), 5);
        assert_eq!(tail.envelope.event_id, 7);
        assert_eq!(writer.envelope.signals[4].signal_id, 4);
        assert_eq!(tail.envelope.signals[0].signal_id, 5);
    }
}
