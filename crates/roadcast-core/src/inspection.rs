//! Inspection and fetch matrices
//!
//! The matrices are the extractor's flattened view of all enabled schemes,
//! consumed by the inspection engine. Every condition reference is an index
//! into `InspectionMatrix::expression_node_storage`; the storage is sized
//! exactly once during extraction and never reallocated afterwards.

use crate::collection::PassThroughMetadata;
use crate::expression::{ExpressionNode, NodeIndex};
use crate::signal::{SignalId, SignalType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type FetchRequestId = u32;

/// One collected signal as the inspection engine sees it, with its resolved
/// type and the fetch requests that feed it.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct InspectionMatrixSignalCollectionInfo {
    pub signal_id: SignalId,
    pub sample_buffer_size: u32,
    pub minimum_sample_interval_ms: u32,
    pub fixed_window_period_ms: u32,
    pub is_condition_only_signal: bool,
    pub signal_type: SignalType,
    pub fetch_request_ids: Vec<FetchRequestId>,
}

/// Condition gating a conditional fetch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConditionForFetch {
    pub condition: NodeIndex,
    pub trigger_only_on_rising_edge: bool,
    pub fetch_request_id: FetchRequestId,
}

/// Condition gating uploads from one store-and-forward partition.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ConditionForForward {
    pub condition: Option<NodeIndex>,
}

/// One enabled scheme's flattened view.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConditionWithCollectedData {
    pub condition: Option<NodeIndex>,
    pub signals: Vec<InspectionMatrixSignalCollectionInfo>,
    pub fetch_conditions: Vec<ConditionForFetch>,
    pub forward_conditions: Vec<ConditionForForward>,
    pub metadata: PassThroughMetadata,
    pub minimum_publish_interval_ms: u32,
    pub after_duration_ms: u32,
    pub include_active_dtcs: bool,
    pub trigger_only_on_rising_edge: bool,
    /// No node of the condition tree references a signal.
    pub is_static_condition: bool,
    /// The tree contains a custom-function or is-null node and must not be
    /// memoized.
    pub always_evaluate_condition: bool,
}

/// Flattened view of all enabled schemes, published as one immutable
/// snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InspectionMatrix {
    pub conditions: Vec<ConditionWithCollectedData>,
    pub expression_node_storage: Vec<ExpressionNode>,
}

/// Literal argument of a fetch action.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum FetchValue {
    Bool(bool),
    Float(f64),
    String(String),
}

/// One custom-function invocation of a fetch request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FetchRequest {
    pub signal_id: SignalId,
    pub function_name: String,
    pub args: Vec<FetchValue>,
}

/// Schedule of a time-based fetch.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PeriodicalFetchParameters {
    pub fetch_frequency_ms: u64,
    pub max_execution_count: u64,
    pub max_execution_count_reset_period_ms: u64,
}

/// All fetch requests of the enabled schemes, keyed by request id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FetchMatrix {
    pub fetch_requests: HashMap<FetchRequestId, Vec<FetchRequest>>,
    pub periodical_fetch_request_setup: HashMap<FetchRequestId, PeriodicalFetchParameters>,
}
