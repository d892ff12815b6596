//! Decoder dictionary extraction
//!
//! Projects the active decoder manifest through the enabled collection
//! schemes into one dictionary per protocol. Malformed signals are logged
//! and skipped; extraction never fails as a whole. The published map always
//! contains every protocol so ingest paths can tell "disabled" from
//! "missing update".

use roadcast_core::manifest::{DecoderManifest, SyncId, VehicleDataSourceProtocol};
use roadcast_core::scheme::CollectionScheme;
use roadcast_core::signal::{
    is_partial_signal_id, ComplexDataElement, SignalId, SignalPath, SignalType,
    INVALID_SIGNAL_ID,
};
use roadcast_decode::dictionary::{
    CanDecoderDictionary, CanMessageDecoderMethod, ComplexDataMessageFormat,
    ComplexDecoderDictionary, CustomDecoderDictionary, DecoderDictionary, DecoderDictionaryMap,
    SignalPathAndPartialSignalId,
};
use roadcast_decode::translator::CanInterfaceIdTranslator;
use roadcast_core::manifest::{CanMessageFormat, CanSignalFormat};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Upper bound on complex types materialized per message, guarding against
/// malformed (cyclic or enormous) type graphs.
pub const MAX_COMPLEX_TYPES: usize = 1000;

/// Result of one extraction pass.
#[derive(Debug, Default)]
pub struct DictionaryExtraction {
    pub dictionaries: DecoderDictionaryMap,
    /// Leaf types of partial signals, used to patch the inspection matrix.
    pub partial_signal_types: HashMap<SignalId, SignalType>,
}

#[derive(Default)]
struct DictionaryBuilders {
    can: Option<CanDecoderDictionary>,
    obd: Option<CanDecoderDictionary>,
    custom: Option<CustomDecoderDictionary>,
    complex: Option<ComplexDecoderDictionary>,
}

/// Walk every collect-signal of every enabled scheme matching the active
/// manifest and place its decoding rule in the protocol's dictionary.
pub fn extract_decoder_dictionaries(
    manifest: &DecoderManifest,
    enabled_schemes: &BTreeMap<SyncId, Arc<CollectionScheme>>,
    translator: &CanInterfaceIdTranslator,
) -> DictionaryExtraction {
    let mut builders = DictionaryBuilders::default();
    let mut partial_signal_types = HashMap::new();

    for scheme in enabled_schemes.values() {
        if scheme.decoder_manifest_sync_id != manifest.sync_id {
            continue;
        }
        for signal in &scheme.collect_signals {
            let top_level_id = signal.signal_id;
            let mut signal_id = top_level_id;
            let mut signal_path = SignalPath::new();
            if is_partial_signal_id(top_level_id) {
                match scheme.partial_signal_lookup.get(&top_level_id) {
                    Some((actual_id, path)) => {
                        signal_id = *actual_id;
                        signal_path = path.clone();
                    }
                    None => {
                        warn!(signal_id = top_level_id, "Unknown partial signal ID");
                        signal_id = INVALID_SIGNAL_ID;
                    }
                }
            }
            add_signal_to_dictionaries(
                manifest,
                translator,
                &mut builders,
                &mut partial_signal_types,
                signal_id,
                top_level_id,
                signal_path,
            );
        }
    }

    let mut dictionaries = DecoderDictionaryMap::new();
    dictionaries.insert(
        VehicleDataSourceProtocol::RawSocket,
        builders.can.map(|d| Arc::new(DecoderDictionary::Can(d))),
    );
    dictionaries.insert(
        VehicleDataSourceProtocol::Obd,
        builders.obd.map(|d| Arc::new(DecoderDictionary::Can(d))),
    );
    dictionaries.insert(
        VehicleDataSourceProtocol::CustomDecoding,
        builders
            .custom
            .map(|d| Arc::new(DecoderDictionary::Custom(d))),
    );
    dictionaries.insert(
        VehicleDataSourceProtocol::ComplexData,
        builders
            .complex
            .map(|d| Arc::new(DecoderDictionary::Complex(d))),
    );
    DictionaryExtraction {
        dictionaries,
        partial_signal_types,
    }
}

fn add_signal_to_dictionaries(
    manifest: &DecoderManifest,
    translator: &CanInterfaceIdTranslator,
    builders: &mut DictionaryBuilders,
    partial_signal_types: &mut HashMap<SignalId, SignalType>,
    signal_id: SignalId,
    top_level_id: SignalId,
    signal_path: SignalPath,
) {
    if signal_id == INVALID_SIGNAL_ID {
        return;
    }
    let Some(protocol) = manifest.network_protocol(signal_id) else {
        warn!(signal_id, "Invalid protocol provided for signal");
        return;
    };
    match protocol {
        VehicleDataSourceProtocol::RawSocket => {
            let Some((frame_id, interface_id)) = manifest.can_frame_and_interface_id(signal_id)
            else {
                warn!(signal_id, "No CAN frame registered for signal");
                return;
            };
            let Some(channel_id) = translator.channel_numeric_id(interface_id) else {
                warn!(signal_id, interface_id = %interface_id, "Invalid interface ID provided");
                return;
            };
            let dictionary = builders.can.get_or_insert_with(Default::default);
            dictionary.signal_ids_to_collect.insert(signal_id);
            dictionary
                .decoder_method
                .entry(channel_id)
                .or_default()
                .entry(frame_id)
                .or_insert_with(|| CanMessageDecoderMethod {
                    format: manifest
                        .can_message_format(frame_id, interface_id)
                        .cloned()
                        .unwrap_or_default(),
                    collect: true,
                });
        }
        VehicleDataSourceProtocol::Obd => {
            let Some(pid_format) = manifest.pid_signal_decoder_format(signal_id) else {
                warn!(signal_id, "No PID decoder format registered for signal");
                return;
            };
            let dictionary = builders.obd.get_or_insert_with(Default::default);
            dictionary.signal_ids_to_collect.insert(signal_id);
            // All PIDs live under the single synthetic OBD channel 0; the
            // PID response becomes a CAN-like frame.
            let frame = dictionary
                .decoder_method
                .entry(0)
                .or_default()
                .entry(u32::from(pid_format.pid))
                .or_insert_with(|| CanMessageDecoderMethod {
                    format: CanMessageFormat {
                        message_id: u32::from(pid_format.pid),
                        size_in_bytes: pid_format.pid_response_length as u8,
                        signals: Vec::new(),
                    },
                    collect: true,
                });
            frame.format.signals.push(CanSignalFormat {
                signal_id,
                is_big_endian: false,
                is_signed: pid_format.is_signed,
                first_bit_position: (pid_format.start_byte * 8) as u16
                    + u16::from(pid_format.bit_right_shift),
                size_in_bits: ((pid_format.byte_length - 1) * 8) as u16
                    + u16::from(pid_format.bit_mask_length),
                factor: pid_format.scaling,
                offset: pid_format.offset,
                signal_type: pid_format.signal_type,
                raw_signal_type: pid_format.raw_signal_type,
            });
        }
        VehicleDataSourceProtocol::CustomDecoding => {
            let Some(format) = manifest.custom_signal_decoder_format(signal_id) else {
                warn!(signal_id, "No custom decoder format registered for signal");
                return;
            };
            if format.interface_id.is_empty() {
                warn!(signal_id, "Custom decoded signal has empty interface ID");
                return;
            }
            let dictionary = builders.custom.get_or_insert_with(Default::default);
            dictionary
                .decoder_method
                .entry(format.interface_id.clone())
                .or_default()
                .insert(format.decoder.clone(), format.clone());
            trace!(signal_id, "Custom decoded signal added");
        }
        VehicleDataSourceProtocol::ComplexData => {
            let Some(format) = manifest.complex_signal_decoder_format(signal_id) else {
                warn!(signal_id, "No complex decoder format registered for signal");
                return;
            };
            if format.interface_id.is_empty() {
                warn!(signal_id, "Complex signal has empty interface ID");
                return;
            }
            let dictionary = builders.complex.get_or_insert_with(Default::default);
            let message = dictionary
                .decoder_method
                .entry(format.interface_id.clone())
                .or_default()
                .entry(format.message_id.clone())
                .or_default();
            put_complex_signal_in_dictionary(
                manifest,
                message,
                signal_id,
                top_level_id,
                signal_path,
                format.root_type_id,
                partial_signal_types,
            );
        }
    }
}

fn put_complex_signal_in_dictionary(
    manifest: &DecoderManifest,
    message: &mut ComplexDataMessageFormat,
    signal_id: SignalId,
    partial_signal_id: SignalId,
    signal_path: SignalPath,
    root_type_id: u32,
    partial_signal_types: &mut HashMap<SignalId, SignalType>,
) {
    if message.signal_id == INVALID_SIGNAL_ID {
        // First access: materialize the reachable subset of the type map.
        message.signal_id = signal_id;
        message.root_type_id = root_type_id;
        let mut to_traverse = vec![root_type_id];
        let mut elements_left = MAX_COMPLEX_TYPES;
        while elements_left > 0 {
            let Some(type_id) = to_traverse.pop() else {
                break;
            };
            elements_left -= 1;
            if message.complex_type_map.contains_key(&type_id) {
                continue;
            }
            let Some(element) = manifest.complex_data_type(type_id) else {
                error!(type_id, "Invalid complex type id");
                continue;
            };
            message.complex_type_map.insert(type_id, element.clone());
            match element {
                ComplexDataElement::Array {
                    repeated_type_id, ..
                } => to_traverse.push(*repeated_type_id),
                ComplexDataElement::Struct { ordered_type_ids } => {
                    to_traverse.extend(ordered_type_ids.iter().copied());
                }
                _ => {}
            }
        }
    }

    if signal_path.is_empty() {
        message.collect_raw = true;
        return;
    }
    let entry = SignalPathAndPartialSignalId {
        signal_path,
        partial_signal_id,
    };
    if let Some(signal_type) = find_partial_signal_type(message, &entry) {
        partial_signal_types.insert(partial_signal_id, signal_type);
    }
    let position = message
        .signal_paths
        .partition_point(|existing| *existing <= entry);
    message.signal_paths.insert(position, entry);
}

/// Follow the signal path through the message's type map to the primitive
/// leaf it addresses.
fn find_partial_signal_type(
    message: &ComplexDataMessageFormat,
    entry: &SignalPathAndPartialSignalId,
) -> Option<SignalType> {
    let mut current_type_id = message.root_type_id;
    let mut current = message.complex_type_map.get(&current_type_id);
    for path_level in &entry.signal_path {
        match current {
            None => {
                error!(type_id = current_type_id, "Could not find type for ID");
                return None;
            }
            Some(ComplexDataElement::Struct { ordered_type_ids }) => {
                current_type_id = *ordered_type_ids.get(*path_level as usize)?;
            }
            Some(ComplexDataElement::Array {
                repeated_type_id, ..
            }) => {
                current_type_id = *repeated_type_id;
            }
            Some(_) => break,
        }
        current = message.complex_type_map.get(&current_type_id);
    }
    match current {
        Some(ComplexDataElement::Primitive { primitive_type }) => Some(*primitive_type),
        _ => {
            trace!(
                type_id = current_type_id,
                "Signal path does not point at a primitive type"
            );
            None
        }
    }
}
