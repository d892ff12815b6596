//! Signal identifiers, value types, and complex-data type descriptions
//!
//! Signal IDs are assigned by the cloud and unique across the whole vehicle
//! regardless of bus. The top bit is reserved for partial signals: IDs the
//! edge derives internally for paths into a complex (nested) signal.

use serde::{Deserialize, Serialize};

/// Cloud-assigned signal identifier, unique across the vehicle.
pub type SignalId = u32;

/// Marks internally-generated partial signal IDs (paths into complex data).
pub const INTERNAL_SIGNAL_ID_BITMASK: SignalId = 0x8000_0000;

pub const INVALID_SIGNAL_ID: SignalId = 0;

/// Index path into a complex signal's type tree (struct member / array
/// element positions, outermost first).
pub type SignalPath = Vec<u32>;

/// Identifier of a type in a complex signal's type map.
pub type ComplexDataTypeId = u32;

/// Reserved type IDs for string leaves of complex signals.
pub const RESERVED_UTF8_STRING_TYPE_ID: ComplexDataTypeId = 0xFFFF_FF00;
pub const RESERVED_UTF16_STRING_TYPE_ID: ComplexDataTypeId = 0xFFFF_FF01;

/// Type tag of a decoded signal value.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SignalType {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    #[default]
    F64,
    /// Opaque byte string.
    String,
    /// Handle into a raw-data buffer owned by the ingestion layer.
    BufferHandle,
}

/// A decoded signal value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum SignalValue {
    Bool(bool),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    String(Vec<u8>),
    BufferHandle(u32),
}

impl SignalValue {
    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalValue::Bool(_) => SignalType::Bool,
            SignalValue::U8(_) => SignalType::U8,
            SignalValue::I8(_) => SignalType::I8,
            SignalValue::U16(_) => SignalType::U16,
            SignalValue::I16(_) => SignalType::I16,
            SignalValue::U32(_) => SignalType::U32,
            SignalValue::I32(_) => SignalType::I32,
            SignalValue::U64(_) => SignalType::U64,
            SignalValue::I64(_) => SignalType::I64,
            SignalValue::F32(_) => SignalType::F32,
            SignalValue::F64(_) => SignalType::F64,
            SignalValue::String(_) => SignalType::String,
            SignalValue::BufferHandle(_) => SignalType::BufferHandle,
        }
    }

    /// Numeric view used by the inspection/upload paths. Strings and buffer
    /// handles have no numeric rendering and yield `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SignalValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            SignalValue::U8(v) => Some(f64::from(*v)),
            SignalValue::I8(v) => Some(f64::from(*v)),
            SignalValue::U16(v) => Some(f64::from(*v)),
            SignalValue::I16(v) => Some(f64::from(*v)),
            SignalValue::U32(v) => Some(f64::from(*v)),
            SignalValue::I32(v) => Some(f64::from(*v)),
            SignalValue::U64(v) => Some(*v as f64),
            SignalValue::I64(v) => Some(*v as f64),
            SignalValue::F32(v) => Some(f64::from(*v)),
            SignalValue::F64(v) => Some(*v),
            SignalValue::String(_) | SignalValue::BufferHandle(_) => None,
        }
    }

    /// Convert a physical (already scaled) value into the storage type the
    /// decoder format asks for.
    pub fn from_physical(physical: f64, signal_type: SignalType) -> SignalValue {
        match signal_type {
            SignalType::Bool => SignalValue::Bool(physical != 0.0),
            SignalType::U8 => SignalValue::U8(physical as u8),
            SignalType::I8 => SignalValue::I8(physical as i8),
            SignalType::U16 => SignalValue::U16(physical as u16),
            SignalType::I16 => SignalValue::I16(physical as i16),
            SignalType::U32 => SignalValue::U32(physical as u32),
            SignalType::I32 => SignalValue::I32(physical as i32),
            SignalType::U64 => SignalValue::U64(physical as u64),
            SignalType::I64 => SignalValue::I64(physical as i64),
            SignalType::F32 => SignalValue::F32(physical as f32),
            SignalType::F64 => SignalValue::F64(physical),
            // Strings and buffer handles never come from a numeric decode.
            SignalType::String | SignalType::BufferHandle => SignalValue::F64(physical),
        }
    }
}

/// Returns true if the ID was generated on the edge for a partial signal.
pub fn is_partial_signal_id(id: SignalId) -> bool {
    (id & INTERNAL_SIGNAL_ID_BITMASK) != 0
}

/// One element of a complex signal's type map.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ComplexDataElement {
    Primitive {
        primitive_type: SignalType,
    },
    Struct {
        ordered_type_ids: Vec<ComplexDataTypeId>,
    },
    Array {
        repeated_type_id: ComplexDataTypeId,
        size: u32,
    },
    String {
        encoding: StringEncoding,
        size: u32,
    },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum StringEncoding {
    Utf8,
    Utf16,
}
