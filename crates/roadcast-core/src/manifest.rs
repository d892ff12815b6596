//! Decoder manifest model
//!
//! The decoder manifest is the cloud's description of how raw bus bytes turn
//! into typed signals. Each signal belongs to exactly one protocol; lookups
//! under a different protocol fail and the caller skips the signal.

use crate::error::ModelError;
use crate::signal::{ComplexDataElement, ComplexDataTypeId, SignalId, SignalType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Version identifier of a cloud artifact (manifest or scheme list).
pub type SyncId = String;

/// Cloud-assigned identifier of a CAN interface (channel), translated to a
/// numeric channel ID on the edge.
pub type InterfaceId = String;

/// Raw CAN frame identifier (the arbitration ID).
pub type CanFrameId = u32;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VehicleDataSourceProtocol {
    /// Raw CAN frames from a socket interface.
    RawSocket,
    /// OBD-II PID polling.
    Obd,
    /// Middleware sources decoded by an opaque decoder string.
    CustomDecoding,
    /// Nested (struct/array) data with per-path partial signals.
    ComplexData,
}

impl VehicleDataSourceProtocol {
    /// All protocols the agent supports. The published dictionary map carries
    /// one entry per element, `None` marking a disabled protocol.
    pub const ALL: [VehicleDataSourceProtocol; 4] = [
        VehicleDataSourceProtocol::RawSocket,
        VehicleDataSourceProtocol::Obd,
        VehicleDataSourceProtocol::CustomDecoding,
        VehicleDataSourceProtocol::ComplexData,
    ];
}

/// How the raw bit pattern of a CAN signal is to be interpreted before
/// scaling.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RawSignalType {
    #[default]
    Integer,
    FloatingPoint,
}

/// Decoding rule for a single signal within a CAN frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CanSignalFormat {
    pub signal_id: SignalId,
    pub is_big_endian: bool,
    pub is_signed: bool,
    pub first_bit_position: u16,
    pub size_in_bits: u16,
    pub factor: f64,
    pub offset: f64,
    pub signal_type: SignalType,
    pub raw_signal_type: RawSignalType,
}

/// Decoding rules for all signals carried by one CAN frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CanMessageFormat {
    pub message_id: u32,
    pub size_in_bytes: u8,
    pub signals: Vec<CanSignalFormat>,
}

impl CanMessageFormat {
    pub fn is_valid(&self) -> bool {
        !self.signals.is_empty()
    }
}

/// Decoding rule for one signal inside an OBD-II PID response.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PidSignalDecoderFormat {
    pub pid_response_length: u32,
    pub service_mode: u8,
    pub pid: u8,
    pub scaling: f64,
    pub offset: f64,
    pub start_byte: u32,
    pub byte_length: u32,
    pub bit_right_shift: u8,
    pub bit_mask_length: u8,
    pub is_signed: bool,
    pub signal_type: SignalType,
    pub raw_signal_type: RawSignalType,
}

/// Decoding rule for a custom-middleware signal. The decoder string's
/// grammar is owned by the data source, not by the agent.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CustomSignalDecoderFormat {
    pub interface_id: InterfaceId,
    pub decoder: String,
    pub signal_type: SignalType,
}

/// Decoding rule for a complex (nested) signal.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ComplexSignalDecoderFormat {
    pub interface_id: InterfaceId,
    pub message_id: String,
    pub root_type_id: ComplexDataTypeId,
}

/// The decoder manifest: per-protocol decoding rules for every signal the
/// cloud may ask a campaign to collect, versioned by `sync_id`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DecoderManifest {
    pub sync_id: SyncId,
    signal_protocols: HashMap<SignalId, VehicleDataSourceProtocol>,
    signal_to_frame: HashMap<SignalId, (CanFrameId, InterfaceId)>,
    can_message_formats: HashMap<InterfaceId, HashMap<CanFrameId, CanMessageFormat>>,
    pid_signals: HashMap<SignalId, PidSignalDecoderFormat>,
    custom_signals: HashMap<SignalId, CustomSignalDecoderFormat>,
    complex_signals: HashMap<SignalId, ComplexSignalDecoderFormat>,
    complex_types: HashMap<ComplexDataTypeId, ComplexDataElement>,
}

impl DecoderManifest {
    pub fn new(sync_id: impl Into<SyncId>) -> Self {
        Self {
            sync_id: sync_id.into(),
            ..Default::default()
        }
    }

    /// Deserialize a manifest received from the cloud.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Register a CAN signal. The signal's decoding rule is appended to the
    /// frame's message format, creating the frame entry if needed.
    pub fn add_can_signal(
        &mut self,
        interface_id: impl Into<InterfaceId>,
        frame_id: CanFrameId,
        frame_size_in_bytes: u8,
        format: CanSignalFormat,
    ) -> Result<(), ModelError> {
        let signal_id = format.signal_id;
        self.register_protocol(signal_id, VehicleDataSourceProtocol::RawSocket)?;
        let interface_id = interface_id.into();
        self.signal_to_frame
            .insert(signal_id, (frame_id, interface_id.clone()));
        let message = self
            .can_message_formats
            .entry(interface_id)
            .or_default()
            .entry(frame_id)
            .or_insert_with(|| CanMessageFormat {
                message_id: frame_id,
                size_in_bytes: frame_size_in_bytes,
                signals: Vec::new(),
            });
        message.signals.push(format);
        Ok(())
    }

    pub fn add_pid_signal(
        &mut self,
        signal_id: SignalId,
        format: PidSignalDecoderFormat,
    ) -> Result<(), ModelError> {
        self.register_protocol(signal_id, VehicleDataSourceProtocol::Obd)?;
        self.pid_signals.insert(signal_id, format);
        Ok(())
    }

    pub fn add_custom_signal(
        &mut self,
        signal_id: SignalId,
        format: CustomSignalDecoderFormat,
    ) -> Result<(), ModelError> {
        self.register_protocol(signal_id, VehicleDataSourceProtocol::CustomDecoding)?;
        self.custom_signals.insert(signal_id, format);
        Ok(())
    }

    pub fn add_complex_signal(
        &mut self,
        signal_id: SignalId,
        format: ComplexSignalDecoderFormat,
    ) -> Result<(), ModelError> {
        self.register_protocol(signal_id, VehicleDataSourceProtocol::ComplexData)?;
        self.complex_signals.insert(signal_id, format);
        Ok(())
    }

    pub fn add_complex_type(&mut self, type_id: ComplexDataTypeId, element: ComplexDataElement) {
        self.complex_types.insert(type_id, element);
    }

    fn register_protocol(
        &mut self,
        signal_id: SignalId,
        protocol: VehicleDataSourceProtocol,
    ) -> Result<(), ModelError> {
        match self.signal_protocols.get(&signal_id) {
            Some(existing) if *existing != protocol => Err(ModelError::DuplicateSignal(signal_id)),
            _ => {
                self.signal_protocols.insert(signal_id, protocol);
                Ok(())
            }
        }
    }

    /// Protocol the signal is decoded under, if the manifest knows it.
    pub fn network_protocol(&self, signal_id: SignalId) -> Option<VehicleDataSourceProtocol> {
        self.signal_protocols.get(&signal_id).copied()
    }

    pub fn can_message_format(
        &self,
        frame_id: CanFrameId,
        interface_id: &str,
    ) -> Option<&CanMessageFormat> {
        self.can_message_formats.get(interface_id)?.get(&frame_id)
    }

    pub fn can_frame_and_interface_id(
        &self,
        signal_id: SignalId,
    ) -> Option<(CanFrameId, &InterfaceId)> {
        self.signal_to_frame
            .get(&signal_id)
            .map(|(frame, interface)| (*frame, interface))
    }

    pub fn pid_signal_decoder_format(&self, signal_id: SignalId) -> Option<&PidSignalDecoderFormat> {
        self.pid_signals.get(&signal_id)
    }

    pub fn custom_signal_decoder_format(
        &self,
        signal_id: SignalId,
    ) -> Option<&CustomSignalDecoderFormat> {
        self.custom_signals.get(&signal_id)
    }

    pub fn complex_signal_decoder_format(
        &self,
        signal_id: SignalId,
    ) -> Option<&ComplexSignalDecoderFormat> {
        self.complex_signals.get(&signal_id)
    }

    pub fn complex_data_type(&self, type_id: ComplexDataTypeId) -> Option<&ComplexDataElement> {
        self.complex_types.get(&type_id)
    }
}
