//! Inspection and fetch matrix extraction
//!
//! Flattens the condition, fetch, and forward ASTs of all enabled schemes
//! into one contiguous node storage. Nodes are deduplicated per scheme (a
//! node reachable from several trees of the same scheme occupies one slot);
//! nodes of different schemes are never shared. After the walk, every edge
//! is rewritten to an index into the storage.

use roadcast_core::expression::{ExpressionNode, ExpressionNodeType, NodeIndex};
use roadcast_core::inspection::{
    ConditionForFetch, ConditionForForward, ConditionWithCollectedData, FetchMatrix, FetchRequest,
    FetchRequestId, FetchValue, InspectionMatrix, InspectionMatrixSignalCollectionInfo,
    PeriodicalFetchParameters,
};
use roadcast_core::manifest::{DecoderManifest, SyncId, VehicleDataSourceProtocol};
use roadcast_core::scheme::CollectionScheme;
use roadcast_core::signal::{is_partial_signal_id, SignalId, SignalType};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

/// Both matrices produced by one extraction pass.
#[derive(Debug, Default)]
pub struct ExtractedMatrices {
    pub inspection: InspectionMatrix,
    pub fetch: FetchMatrix,
}

/// Identity of a node in its source scheme, used for per-scheme dedup.
type SourceNode = (usize, NodeIndex);

struct NodeCollector {
    node_to_index: HashMap<SourceNode, u32>,
    nodes: Vec<SourceNode>,
}

impl NodeCollector {
    fn new() -> Self {
        Self {
            node_to_index: HashMap::new(),
            nodes: Vec::new(),
        }
    }

    /// Depth-first preorder walk: the node itself, custom-function
    /// parameters in call order, then left, then right. Revisiting a node
    /// of the same scheme reuses its slot.
    fn walk(
        &mut self,
        scheme_index: usize,
        scheme: &CollectionScheme,
        node_index: NodeIndex,
        is_static_condition: &mut bool,
        always_evaluate_condition: &mut bool,
    ) {
        if self.node_to_index.contains_key(&(scheme_index, node_index)) {
            return;
        }
        let Some(node) = scheme.node(node_index) else {
            warn!(
                scheme = %scheme.sync_id,
                node = node_index,
                "Expression references a node outside the scheme arena"
            );
            return;
        };
        self.node_to_index
            .insert((scheme_index, node_index), self.nodes.len() as u32);
        self.nodes.push((scheme_index, node_index));

        match node.node_type {
            ExpressionNodeType::Signal => {
                // A signal reference makes the condition non-static.
                *is_static_condition = false;
            }
            ExpressionNodeType::CustomFunction => {
                *always_evaluate_condition = true;
                for param in node.function.custom_function_params.clone() {
                    self.walk(
                        scheme_index,
                        scheme,
                        param,
                        is_static_condition,
                        always_evaluate_condition,
                    );
                }
            }
            ExpressionNodeType::IsNullFunction => {
                *always_evaluate_condition = true;
            }
            _ => {}
        }
        if let Some(left) = node.left {
            self.walk(
                scheme_index,
                scheme,
                left,
                is_static_condition,
                always_evaluate_condition,
            );
        }
        if let Some(right) = node.right {
            self.walk(
                scheme_index,
                scheme,
                right,
                is_static_condition,
                always_evaluate_condition,
            );
        }
    }

    fn index_of(&self, scheme_index: usize, node_index: NodeIndex) -> Option<u32> {
        self.node_to_index.get(&(scheme_index, node_index)).copied()
    }
}

/// Build both matrices from the schemes enabled under the active manifest.
pub fn extract_matrices(
    enabled_schemes: &BTreeMap<SyncId, Arc<CollectionScheme>>,
    manifest: &DecoderManifest,
) -> ExtractedMatrices {
    let mut collector = NodeCollector::new();
    let mut inspection = InspectionMatrix::default();
    let mut fetch = FetchMatrix::default();
    let mut fetch_request_id: FetchRequestId = 0;

    let schemes: Vec<&Arc<CollectionScheme>> = enabled_schemes
        .values()
        .filter(|scheme| scheme.decoder_manifest_sync_id == manifest.sync_id)
        .collect();

    for (scheme_index, scheme) in schemes.iter().enumerate() {
        let mut condition_data = condition_with_collected_data(scheme, manifest);

        if let Some(root) = scheme.condition {
            collector.walk(
                scheme_index,
                scheme,
                root,
                &mut condition_data.is_static_condition,
                &mut condition_data.always_evaluate_condition,
            );
            condition_data.condition = collector.index_of(scheme_index, root);
        }

        for fetch_information in &scheme.fetch_informations {
            let mut valid = true;
            let mut requests = Vec::new();

            for action in &fetch_information.actions {
                let Some(action_node) = scheme.node(*action) else {
                    valid = false;
                    break;
                };
                if action_node.node_type != ExpressionNodeType::CustomFunction {
                    warn!(
                        scheme = %scheme.sync_id,
                        "Ignored fetch information: only custom function actions are supported"
                    );
                    valid = false;
                    break;
                }
                let mut args = Vec::new();
                for param in &action_node.function.custom_function_params {
                    let Some(param_node) = scheme.node(*param) else {
                        valid = false;
                        break;
                    };
                    match param_node.node_type {
                        ExpressionNodeType::Boolean => {
                            args.push(FetchValue::Bool(param_node.boolean_value));
                        }
                        ExpressionNodeType::Float => {
                            args.push(FetchValue::Float(param_node.floating_value));
                        }
                        ExpressionNodeType::String => {
                            args.push(FetchValue::String(param_node.string_value.clone()));
                        }
                        _ => {
                            warn!(
                                scheme = %scheme.sync_id,
                                "Ignored fetch information: only boolean, float and string \
                                 action arguments are supported"
                            );
                            valid = false;
                            break;
                        }
                    }
                }
                if !valid {
                    break;
                }
                requests.push(FetchRequest {
                    signal_id: fetch_information.signal_id,
                    function_name: action_node.function.custom_function_name.clone(),
                    args,
                });
            }

            if fetch_information.condition.is_none() && fetch_information.execution_period_ms == 0 {
                warn!(
                    scheme = %scheme.sync_id,
                    "Ignored fetch information: time-based fetch needs an execution period"
                );
                valid = false;
            }
            if !valid {
                continue;
            }

            fetch.fetch_requests.insert(fetch_request_id, requests);

            match fetch_information.condition {
                None => {
                    fetch.periodical_fetch_request_setup.insert(
                        fetch_request_id,
                        PeriodicalFetchParameters {
                            fetch_frequency_ms: fetch_information.execution_period_ms,
                            max_execution_count: fetch_information.max_execution_per_interval,
                            max_execution_count_reset_period_ms: fetch_information
                                .execution_interval_ms,
                        },
                    );
                }
                Some(condition_root) => {
                    let mut always_evaluate = false;
                    collector.walk(
                        scheme_index,
                        scheme,
                        condition_root,
                        &mut condition_data.is_static_condition,
                        &mut always_evaluate,
                    );
                    if let Some(condition) = collector.index_of(scheme_index, condition_root) {
                        condition_data.fetch_conditions.push(ConditionForFetch {
                            condition,
                            trigger_only_on_rising_edge: fetch_information
                                .trigger_only_on_rising_edge,
                            fetch_request_id,
                        });
                    }
                }
            }

            for signal in &mut condition_data.signals {
                if signal.signal_id == fetch_information.signal_id {
                    signal.fetch_request_ids.push(fetch_request_id);
                }
            }
            fetch_request_id += 1;
        }

        for partition in &scheme.partitions {
            let condition = partition.upload_condition.and_then(|root| {
                let mut always_evaluate = false;
                collector.walk(
                    scheme_index,
                    scheme,
                    root,
                    &mut condition_data.is_static_condition,
                    &mut always_evaluate,
                );
                collector.index_of(scheme_index, root)
            });
            condition_data
                .forward_conditions
                .push(ConditionForForward { condition });
        }

        inspection.conditions.push(condition_data);
    }

    // Lay the collected nodes out contiguously, rewriting every edge to an
    // index into the storage.
    inspection.expression_node_storage = collector
        .nodes
        .iter()
        .map(|(scheme_index, node_index)| {
            // Walked nodes always exist; a default node keeps indices
            // stable if a scheme arena was somehow truncated.
            let Some(source) = schemes[*scheme_index].node(*node_index) else {
                return ExpressionNode::default();
            };
            let mut node = ExpressionNode {
                node_type: source.node_type,
                left: None,
                right: None,
                floating_value: source.floating_value,
                boolean_value: source.boolean_value,
                string_value: source.string_value.clone(),
                signal_id: source.signal_id,
                function: source.function.clone(),
            };
            node.left = source
                .left
                .and_then(|left| collector.index_of(*scheme_index, left));
            node.right = source
                .right
                .and_then(|right| collector.index_of(*scheme_index, right));
            node.function.custom_function_params = source
                .function
                .custom_function_params
                .iter()
                .filter_map(|param| collector.index_of(*scheme_index, *param))
                .collect();
            node
        })
        .collect();

    ExtractedMatrices { inspection, fetch }
}

/// Overwrite the signal type of partial signals once the dictionary
/// extractor has resolved their leaf types. Matrix creation happens before
/// the complex type tree is walked, so partial signals start with the
/// default type.
pub fn patch_partial_signal_types(
    matrix: &mut InspectionMatrix,
    partial_signal_types: &HashMap<SignalId, SignalType>,
) {
    if partial_signal_types.is_empty() {
        return;
    }
    for condition in &mut matrix.conditions {
        for signal in &mut condition.signals {
            if let Some(signal_type) = partial_signal_types.get(&signal.signal_id) {
                signal.signal_type = *signal_type;
            }
        }
    }
}

fn condition_with_collected_data(
    scheme: &CollectionScheme,
    manifest: &DecoderManifest,
) -> ConditionWithCollectedData {
    let mut condition_data = ConditionWithCollectedData {
        metadata: roadcast_core::collection::PassThroughMetadata {
            compress: scheme.compress,
            persist: scheme.persist,
            priority: scheme.priority,
            decoder_id: scheme.decoder_manifest_sync_id.clone(),
            collection_scheme_id: scheme.sync_id.clone(),
            campaign_arn: scheme.campaign_arn.clone(),
        },
        minimum_publish_interval_ms: scheme.minimum_publish_interval_ms,
        after_duration_ms: scheme.after_duration_ms,
        include_active_dtcs: scheme.include_active_dtcs,
        trigger_only_on_rising_edge: scheme.trigger_only_on_rising_edge,
        is_static_condition: true,
        always_evaluate_condition: false,
        ..Default::default()
    };
    for signal in &scheme.collect_signals {
        condition_data
            .signals
            .push(InspectionMatrixSignalCollectionInfo {
                signal_id: signal.signal_id,
                sample_buffer_size: signal.sample_buffer_size,
                minimum_sample_interval_ms: signal.minimum_sample_interval_ms,
                fixed_window_period_ms: signal.fixed_window_period_ms,
                is_condition_only_signal: signal.is_condition_only_signal,
                signal_type: signal_type_for(manifest, signal.signal_id),
                fetch_request_ids: Vec::new(),
            });
    }
    condition_data
}

/// Resolve a signal's storage type from the manifest. Partial signals keep
/// the default type here; the dictionary extractor patches them afterwards.
fn signal_type_for(manifest: &DecoderManifest, signal_id: SignalId) -> SignalType {
    if is_partial_signal_id(signal_id) {
        return SignalType::default();
    }
    match manifest.network_protocol(signal_id) {
        Some(VehicleDataSourceProtocol::RawSocket) => manifest
            .can_frame_and_interface_id(signal_id)
            .and_then(|(frame, interface)| manifest.can_message_format(frame, interface))
            .and_then(|format| {
                format
                    .signals
                    .iter()
                    .find(|signal| signal.signal_id == signal_id)
                    .map(|signal| signal.signal_type)
            })
            .unwrap_or_default(),
        Some(VehicleDataSourceProtocol::Obd) => manifest
            .pid_signal_decoder_format(signal_id)
            .map(|format| format.signal_type)
            .unwrap_or_default(),
        Some(VehicleDataSourceProtocol::CustomDecoding) => manifest
            .custom_signal_decoder_format(signal_id)
            .map(|format| format.signal_type)
            .unwrap_or_default(),
        Some(VehicleDataSourceProtocol::ComplexData) | None => SignalType::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roadcast_core::manifest::CanSignalFormat;
    use roadcast_core::scheme::{
        FetchInformation, PartitionConfiguration, SignalCollectionInfo, StorageOptions,
    };

    fn manifest_with_can_signal(signal_id: SignalId, signal_type: SignalType) -> DecoderManifest {
        let mut manifest = DecoderManifest::new("dm-1");
        manifest
            .add_can_signal(
                "can0",
                0x101,
                8,
                CanSignalFormat {
                    signal_id,
                    size_in_bits: 16,
                    factor: 1.0,
                    signal_type,
                    ..Default::default()
                },
            )
            .unwrap();
        manifest
    }

    fn base_scheme(sync_id: &str) -> CollectionScheme {
        CollectionScheme {
            sync_id: sync_id.into(),
            campaign_arn: format!("arn:aws:iam::1:user/{sync_id}"),
            decoder_manifest_sync_id: "dm-1".into(),
            priority: 5,
            compress: true,
            persist: true,
            ..Default::default()
        }
    }

    fn enabled(schemes: Vec<CollectionScheme>) -> BTreeMap<SyncId, Arc<CollectionScheme>> {
        schemes
            .into_iter()
            .map(|scheme| (scheme.sync_id.clone(), Arc::new(scheme)))
            .collect()
    }

    /// scheme condition: signal(10) > 100.0
    fn scheme_with_condition(sync_id: &str, signal_id: SignalId) -> CollectionScheme {
        let mut scheme = base_scheme(sync_id);
        let lhs = scheme.push_node(ExpressionNode::signal(signal_id));
        let rhs = scheme.push_node(ExpressionNode::float(100.0));
        let root = scheme.push_node(ExpressionNode::operator(
            ExpressionNodeType::OperatorBigger,
            Some(lhs),
            Some(rhs),
        ));
        scheme.condition = Some(root);
        scheme.collect_signals.push(SignalCollectionInfo {
            signal_id,
            sample_buffer_size: 100,
            ..Default::default()
        });
        scheme
    }

    #[test]
    fn test_edges_point_into_storage() {
        let manifest = manifest_with_can_signal(10, SignalType::U16);
        let matrices = extract_matrices(&enabled(vec![scheme_with_condition("s1", 10)]), &manifest);

        let matrix = &matrices.inspection;
        assert_eq!(matrix.conditions.len(), 1);
        assert_eq!(matrix.expression_node_storage.len(), 3);

        let root = matrix.conditions[0].condition.unwrap() as usize;
        let root_node = &matrix.expression_node_storage[root];
        assert_eq!(root_node.node_type, ExpressionNodeType::OperatorBigger);
        let left = root_node.left.unwrap() as usize;
        let right = root_node.right.unwrap() as usize;
        assert!(left < matrix.expression_node_storage.len());
        assert!(right < matrix.expression_node_storage.len());
        assert_eq!(
            matrix.expression_node_storage[left].node_type,
            ExpressionNodeType::Signal
        );
        assert_eq!(matrix.expression_node_storage[left].signal_id, 10);
        assert_eq!(
            matrix.expression_node_storage[right].floating_value,
            100.0
        );
    }

    #[test]
    fn test_signal_type_resolved_from_manifest() {
        let manifest = manifest_with_can_signal(10, SignalType::U16);
        let matrices = extract_matrices(&enabled(vec![scheme_with_condition("s1", 10)]), &manifest);
        assert_eq!(
            matrices.inspection.conditions[0].signals[0].signal_type,
            SignalType::U16
        );
    }

    #[test]
    fn test_static_and_always_evaluate_flags() {
        let manifest = manifest_with_can_signal(10, SignalType::U16);

        // Condition without signals is static.
        let mut static_scheme = base_scheme("s-static");
        let lhs = static_scheme.push_node(ExpressionNode::float(1.0));
        let rhs = static_scheme.push_node(ExpressionNode::float(2.0));
        let root = static_scheme.push_node(ExpressionNode::operator(
            ExpressionNodeType::OperatorSmaller,
            Some(lhs),
            Some(rhs),
        ));
        static_scheme.condition = Some(root);

        // Custom function forces re-evaluation.
        let mut custom_scheme = base_scheme("s-custom");
        let param = custom_scheme.push_node(ExpressionNode::float(3.0));
        let call = custom_scheme.push_node(ExpressionNode::custom_function("dtc_query", vec![param]));
        custom_scheme.condition = Some(call);

        let matrices = extract_matrices(
            &enabled(vec![
                static_scheme,
                custom_scheme,
                scheme_with_condition("s-signal", 10),
            ]),
            &manifest,
        );
        let by_id: HashMap<&str, &ConditionWithCollectedData> = matrices
            .inspection
            .conditions
            .iter()
            .map(|condition| (condition.metadata.collection_scheme_id.as_str(), condition))
            .collect();

        assert!(by_id["s-static"].is_static_condition);
        assert!(!by_id["s-static"].always_evaluate_condition);
        assert!(by_id["s-custom"].is_static_condition);
        assert!(by_id["s-custom"].always_evaluate_condition);
        assert!(!by_id["s-signal"].is_static_condition);
    }

    #[test]
    fn test_nodes_not_shared_across_schemes() {
        let manifest = manifest_with_can_signal(10, SignalType::U16);
        let matrices = extract_matrices(
            &enabled(vec![
                scheme_with_condition("s1", 10),
                scheme_with_condition("s2", 10),
            ]),
            &manifest,
        );
        // Equal trees from two schemes occupy distinct slots.
        assert_eq!(matrices.inspection.expression_node_storage.len(), 6);
        let c0 = matrices.inspection.conditions[0].condition.unwrap();
        let c1 = matrices.inspection.conditions[1].condition.unwrap();
        assert_ne!(c0, c1);
    }

    #[test]
    fn test_node_shared_within_scheme_deduplicated() {
        let manifest = manifest_with_can_signal(10, SignalType::U16);
        let mut scheme = scheme_with_condition("s1", 10);
        // Fetch condition reuses the scheme's condition root.
        let action = scheme.push_node(ExpressionNode::custom_function("fetch_signal", vec![]));
        scheme.fetch_informations.push(FetchInformation {
            signal_id: 10,
            condition: scheme.condition,
            actions: vec![action],
            ..Default::default()
        });
        let matrices = extract_matrices(&enabled(vec![scheme]), &manifest);
        // Only the 3 condition nodes land in storage (actions become fetch
        // requests, not stored nodes); the fetch condition reuses the same
        // slots.
        assert_eq!(matrices.inspection.expression_node_storage.len(), 3);
        let condition = &matrices.inspection.conditions[0];
        assert_eq!(
            condition.condition.unwrap(),
            condition.fetch_conditions[0].condition
        );
    }

    #[test]
    fn test_periodic_fetch_goes_to_setup() {
        let manifest = manifest_with_can_signal(10, SignalType::U16);
        let mut scheme = scheme_with_condition("s1", 10);
        let param = scheme.push_node(ExpressionNode::string("Vehicle.Speed"));
        let action = scheme.push_node(ExpressionNode::custom_function("poll", vec![param]));
        scheme.fetch_informations.push(FetchInformation {
            signal_id: 10,
            condition: None,
            execution_period_ms: 500,
            max_execution_per_interval: 3,
            execution_interval_ms: 10_000,
            actions: vec![action],
            ..Default::default()
        });
        let matrices = extract_matrices(&enabled(vec![scheme]), &manifest);

        assert_eq!(matrices.fetch.fetch_requests.len(), 1);
        let setup = &matrices.fetch.periodical_fetch_request_setup[&0];
        assert_eq!(setup.fetch_frequency_ms, 500);
        assert_eq!(setup.max_execution_count, 3);
        let request = &matrices.fetch.fetch_requests[&0][0];
        assert_eq!(request.function_name, "poll");
        assert_eq!(request.args, vec![FetchValue::String("Vehicle.Speed".into())]);
        // The collect-signal entry is linked to the request.
        assert_eq!(
            matrices.inspection.conditions[0].signals[0].fetch_request_ids,
            vec![0]
        );
    }

    #[test]
    fn test_invalid_fetch_dropped_entirely() {
        let manifest = manifest_with_can_signal(10, SignalType::U16);
        let mut scheme = scheme_with_condition("s1", 10);

        // One bad parameter (a signal reference) invalidates the fetch.
        let bad_param = scheme.push_node(ExpressionNode::signal(10));
        let action = scheme.push_node(ExpressionNode::custom_function("poll", vec![bad_param]));
        scheme.fetch_informations.push(FetchInformation {
            signal_id: 10,
            condition: None,
            execution_period_ms: 500,
            actions: vec![action],
            ..Default::default()
        });
        // A fetch with neither condition nor period is dropped too.
        let action2 = scheme.push_node(ExpressionNode::custom_function("poll", vec![]));
        scheme.fetch_informations.push(FetchInformation {
            signal_id: 10,
            condition: None,
            execution_period_ms: 0,
            actions: vec![action2],
            ..Default::default()
        });

        let matrices = extract_matrices(&enabled(vec![scheme]), &manifest);
        assert!(matrices.fetch.fetch_requests.is_empty());
        assert!(matrices.fetch.periodical_fetch_request_setup.is_empty());
        assert!(matrices.inspection.conditions[0].signals[0]
            .fetch_request_ids
            .is_empty());
    }

    #[test]
    fn test_forward_conditions_from_partitions() {
        let manifest = manifest_with_can_signal(10, SignalType::U16);
        let mut scheme = scheme_with_condition("s1", 10);
        let lhs = scheme.push_node(ExpressionNode::signal(10));
        let rhs = scheme.push_node(ExpressionNode::float(1.0));
        let upload_root = scheme.push_node(ExpressionNode::operator(
            ExpressionNodeType::OperatorEqual,
            Some(lhs),
            Some(rhs),
        ));
        scheme.partitions.push(PartitionConfiguration {
            storage_options: StorageOptions {
                maximum_size_in_bytes: 1024,
                storage_location: "p0".into(),
                minimum_time_to_live_in_seconds: 60,
            },
            upload_condition: Some(upload_root),
        });
        scheme.partitions.push(PartitionConfiguration::default());

        let matrices = extract_matrices(&enabled(vec![scheme]), &manifest);
        let condition = &matrices.inspection.conditions[0];
        assert_eq!(condition.forward_conditions.len(), 2);
        assert!(condition.forward_conditions[0].condition.is_some());
        assert!(condition.forward_conditions[1].condition.is_none());

        // The upload condition's signal node was deduplicated with the
        // trigger condition's.
        let storage = &matrices.inspection.expression_node_storage;
        let forward_root = condition.forward_conditions[0].condition.unwrap() as usize;
        let forward_left = storage[forward_root].left.unwrap();
        let trigger_root = condition.condition.unwrap() as usize;
        let trigger_left = storage[trigger_root].left.unwrap();
        assert_eq!(forward_left, trigger_left);
    }

    #[test]
    fn test_schemes_for_other_manifest_skipped() {
        let manifest = manifest_with_can_signal(10, SignalType::U16);
        let mut scheme = scheme_with_condition("s1", 10);
        scheme.decoder_manifest_sync_id = "dm-other".into();
        let matrices = extract_matrices(&enabled(vec![scheme]), &manifest);
        assert!(matrices.inspection.conditions.is_empty());
        assert!(matrices.inspection.expression_node_storage.is_empty());
    }

    #[test]
    fn test_partial_type_patch() {
        let manifest = manifest_with_can_signal(10, SignalType::U16);
        let partial_id = 7 | roadcast_core::signal::INTERNAL_SIGNAL_ID_BITMASK;
        let mut scheme = base_scheme("s1");
        scheme.collect_signals.push(SignalCollectionInfo {
            signal_id: partial_id,
            ..Default::default()
        });
        let mut matrices = extract_matrices(&enabled(vec![scheme]), &manifest);
        assert_eq!(
            matrices.inspection.conditions[0].signals[0].signal_type,
            SignalType::F64
        );

        let mut partial_types = HashMap::new();
        partial_types.insert(partial_id, SignalType::U8);
        patch_partial_signal_types(&mut matrices.inspection, &partial_types);
        assert_eq!(
            matrices.inspection.conditions[0].signals[0].signal_type,
            SignalType::U8
        );
    }
}
