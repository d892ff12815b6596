//! Decoder dictionaries
//!
//! A dictionary is the per-protocol lookup the ingest paths consult for
//! every received frame or message. Dictionaries are built by the campaign
//! manager's extractor and published as immutable shared snapshots; the map
//! always carries an entry for every supported protocol, with `None`
//! signalling "disabled, drop traffic".

use crate::translator::CanChannelId;
use roadcast_core::manifest::{
    CanFrameId, CanMessageFormat, CustomSignalDecoderFormat, InterfaceId,
    VehicleDataSourceProtocol,
};
use roadcast_core::signal::{
    ComplexDataElement, ComplexDataTypeId, SignalId, SignalPath, INVALID_SIGNAL_ID,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Per-protocol dictionary snapshot handed to subscribers on every change.
pub type DecoderDictionaryMap =
    HashMap<VehicleDataSourceProtocol, Option<Arc<DecoderDictionary>>>;

/// Sum of the per-protocol dictionary shapes. Consumers match on the
/// protocol they serve.
#[derive(Clone, Debug)]
pub enum DecoderDictionary {
    Can(CanDecoderDictionary),
    Custom(CustomDecoderDictionary),
    Complex(ComplexDecoderDictionary),
}

/// Decoding rules for one CAN frame plus whether its signals are collected.
#[derive(Clone, Debug, Default)]
pub struct CanMessageDecoderMethod {
    pub format: CanMessageFormat,
    pub collect: bool,
}

/// Dictionary for CAN ingest. OBD shares the shape: all PIDs live under the
/// single synthetic channel 0 and each PID becomes a frame entry.
#[derive(Clone, Debug, Default)]
pub struct CanDecoderDictionary {
    pub decoder_method: HashMap<CanChannelId, HashMap<CanFrameId, CanMessageDecoderMethod>>,
    pub signal_ids_to_collect: HashSet<SignalId>,
}

impl CanDecoderDictionary {
    pub fn decoder_method(
        &self,
        channel: CanChannelId,
        frame_id: CanFrameId,
    ) -> Option<&CanMessageDecoderMethod> {
        self.decoder_method.get(&channel)?.get(&frame_id)
    }

    /// View of the synthetic OBD channel as a PID-keyed format map, the
    /// shape the OBD decoder consumes.
    pub fn pid_formats(&self) -> HashMap<u8, CanMessageFormat> {
        self.decoder_method
            .get(&0)
            .map(|frames| {
                frames
                    .iter()
                    .map(|(frame_id, method)| (*frame_id as u8, method.format.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Dictionary for custom-middleware ingest, keyed by interface then decoder
/// string.
#[derive(Clone, Debug, Default)]
pub struct CustomDecoderDictionary {
    pub decoder_method: HashMap<InterfaceId, HashMap<String, CustomSignalDecoderFormat>>,
}

/// A signal path into a complex message together with the partial signal ID
/// the edge generated for it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SignalPathAndPartialSignalId {
    pub signal_path: SignalPath,
    pub partial_signal_id: SignalId,
}

/// Decoding rules for one complex message: which paths to extract, whether
/// the raw message is collected, and the needed subset of the type map.
#[derive(Clone, Debug)]
pub struct ComplexDataMessageFormat {
    pub signal_id: SignalId,
    pub root_type_id: ComplexDataTypeId,
    pub collect_raw: bool,
    /// Kept sorted by path so ingest can walk the message once.
    pub signal_paths: Vec<SignalPathAndPartialSignalId>,
    pub complex_type_map: HashMap<ComplexDataTypeId, ComplexDataElement>,
}

impl Default for ComplexDataMessageFormat {
    fn default() -> Self {
        Self {
            signal_id: INVALID_SIGNAL_ID,
            root_type_id: 0,
            collect_raw: false,
            signal_paths: Vec::new(),
            complex_type_map: HashMap::new(),
        }
    }
}

/// Dictionary for complex-data ingest, keyed by interface then message ID.
#[derive(Clone, Debug, Default)]
pub struct ComplexDecoderDictionary {
    pub decoder_method: HashMap<InterfaceId, HashMap<String, ComplexDataMessageFormat>>,
}
