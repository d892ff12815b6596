//! Collected data passed from the inspection engine to the upload paths

use crate::signal::{SignalId, SignalValue};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};

/// Identifier of one trigger firing; groups all chunks of one upload.
pub type EventId = u32;

/// One sampled signal value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CollectedSignal {
    pub signal_id: SignalId,
    pub receive_time: Timestamp,
    pub value: SignalValue,
}

/// Active diagnostic trouble codes captured alongside a trigger.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DtcInfo {
    pub receive_time: Timestamp,
    pub codes: Vec<String>,
}

/// Campaign metadata carried through collection into the upload payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PassThroughMetadata {
    pub compress: bool,
    pub persist: bool,
    pub priority: u32,
    pub decoder_id: String,
    pub collection_scheme_id: String,
    pub campaign_arn: String,
}

/// Everything the inspection engine emits when a scheme's condition fires.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TriggeredCollectionSchemeData {
    pub metadata: PassThroughMetadata,
    pub event_id: EventId,
    pub trigger_time: Timestamp,
    pub signals: Vec<CollectedSignal>,
    pub active_dtcs: Option<DtcInfo>,
}
