//! Collection scheme model
//!
//! A collection scheme ("what to collect, when, where to send") references a
//! decoder manifest by sync id and owns its expression nodes in one arena.
//! Roots of the condition, fetch, and partition-upload trees are arena
//! indices.

use crate::error::ModelError;
use crate::expression::{ExpressionNode, NodeIndex};
use crate::manifest::SyncId;
use crate::signal::{SignalId, SignalPath};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One signal a scheme samples, with its buffering parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalCollectionInfo {
    pub signal_id: SignalId,
    pub sample_buffer_size: u32,
    pub minimum_sample_interval_ms: u32,
    pub fixed_window_period_ms: u32,
    /// Signal participates in condition evaluation only and is not uploaded.
    pub is_condition_only_signal: bool,
    /// Store-and-forward partition the signal is spooled to.
    pub data_partition_id: u32,
}

/// A scheduled or conditional invocation of a named custom function whose
/// result is treated as a signal.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FetchInformation {
    pub signal_id: SignalId,
    /// Condition tree root; `None` makes the fetch time-based.
    pub condition: Option<NodeIndex>,
    pub trigger_only_on_rising_edge: bool,
    pub execution_period_ms: u64,
    pub max_execution_per_interval: u64,
    pub execution_interval_ms: u64,
    /// Action roots; each must be a custom-function node.
    pub actions: Vec<NodeIndex>,
}

/// Disk quota and location for one store-and-forward partition.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageOptions {
    pub maximum_size_in_bytes: u64,
    pub storage_location: String,
    pub minimum_time_to_live_in_seconds: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PartitionConfiguration {
    pub storage_options: StorageOptions,
    /// Root of the condition gating uploads from this partition.
    pub upload_condition: Option<NodeIndex>,
}

/// Cloud campaign descriptor, versioned by `sync_id`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CollectionScheme {
    pub sync_id: SyncId,
    pub campaign_arn: String,
    pub decoder_manifest_sync_id: SyncId,
    /// Activation and expiry, ms since epoch.
    pub start_time: u64,
    pub expiry_time: u64,
    pub minimum_publish_interval_ms: u32,
    pub after_duration_ms: u32,
    pub priority: u32,
    pub persist: bool,
    pub compress: bool,
    pub include_active_dtcs: bool,
    pub trigger_only_on_rising_edge: bool,
    /// Root of the trigger condition tree.
    pub condition: Option<NodeIndex>,
    /// Arena holding every expression node of this scheme (condition, fetch
    /// conditions and actions, partition upload conditions).
    pub expression_nodes: Vec<ExpressionNode>,
    pub collect_signals: Vec<SignalCollectionInfo>,
    pub fetch_informations: Vec<FetchInformation>,
    pub partitions: Vec<PartitionConfiguration>,
    /// Partial signal ID -> (top-level complex signal, path into its type
    /// tree).
    pub partial_signal_lookup: HashMap<SignalId, (SignalId, SignalPath)>,
}

impl CollectionScheme {
    /// Append a node to the scheme's arena, returning its index.
    pub fn push_node(&mut self, node: ExpressionNode) -> NodeIndex {
        self.expression_nodes.push(node);
        (self.expression_nodes.len() - 1) as NodeIndex
    }

    pub fn node(&self, index: NodeIndex) -> Option<&ExpressionNode> {
        self.expression_nodes.get(index as usize)
    }
}

/// The full set of schemes currently issued by the cloud. Replaces any
/// active set atomically.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActiveCollectionSchemes {
    pub schemes: Vec<CollectionScheme>,
}

impl ActiveCollectionSchemes {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        Ok(postcard::to_allocvec(self)?)
    }
}
