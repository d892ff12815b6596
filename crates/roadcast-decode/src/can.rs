//! CAN frame decoding
//!
//! Bit layout follows the DBC conventions: little-endian signals occupy a
//! contiguous window starting at `first_bit_position`; big-endian signals
//! use the Motorola "backward" walk, taking the bits from
//! `first_bit_position % 8` upward in the start byte as the least
//! significant chunk and continuing through lower byte addresses.

use roadcast_core::collection::CollectedSignal;
use roadcast_core::manifest::{CanMessageFormat, CanSignalFormat, RawSignalType};
use roadcast_core::signal::{SignalId, SignalValue};
use roadcast_core::time::Timestamp;
use std::collections::HashSet;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// At least one collected signal had an illegal bit window or floating
    /// point width. Signals decoded before and after the offender are kept.
    #[error("{skipped} signal(s) skipped due to invalid layout in frame {frame_id:#x}")]
    InvalidSignalLayout { frame_id: u32, skipped: usize },
}

#[derive(Debug, Default)]
pub struct CanDecoder;

impl CanDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode all collected signals of a frame, appending to `decoded`.
    /// Signals with an invalid layout are skipped; if any were skipped the
    /// call returns an error while the valid partial result remains in
    /// `decoded`.
    pub fn decode_can_message(
        &self,
        frame_data: &[u8],
        format: &CanMessageFormat,
        signal_ids_to_collect: &HashSet<SignalId>,
        receive_time: Timestamp,
        decoded: &mut Vec<CollectedSignal>,
    ) -> Result<(), DecodeError> {
        let mut skipped = 0usize;
        for signal in &format.signals {
            if !signal_ids_to_collect.contains(&signal.signal_id) {
                continue;
            }
            match decode_signal(frame_data, signal) {
                Some(physical) => decoded.push(CollectedSignal {
                    signal_id: signal.signal_id,
                    receive_time,
                    value: SignalValue::from_physical(physical, signal.signal_type),
                }),
                None => {
                    warn!(
                        signal_id = signal.signal_id,
                        frame_id = format.message_id,
                        "Skipping signal with invalid layout"
                    );
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            return Err(DecodeError::InvalidSignalLayout {
                frame_id: format.message_id,
                skipped,
            });
        }
        Ok(())
    }
}

/// Extract and scale one signal. `None` when the bit window is illegal for
/// the frame or the raw floating-point width is not 32/64.
fn decode_signal(frame_data: &[u8], signal: &CanSignalFormat) -> Option<f64> {
    let size = signal.size_in_bits as u32;
    if size == 0 || size > 64 {
        return None;
    }
    if signal.raw_signal_type == RawSignalType::FloatingPoint && size != 32 && size != 64 {
        return None;
    }
    let raw = if signal.is_big_endian {
        extract_big_endian(frame_data, signal.first_bit_position as u32, size)?
    } else {
        extract_little_endian(frame_data, signal.first_bit_position as u32, size)?
    };

    let physical_raw = match signal.raw_signal_type {
        RawSignalType::FloatingPoint => {
            if size == 32 {
                f64::from(f32::from_bits(raw as u32))
            } else {
                f64::from_bits(raw)
            }
        }
        RawSignalType::Integer => {
            if signal.is_signed {
                sign_extend(raw, size) as f64
            } else {
                raw as f64
            }
        }
    };
    Some(physical_raw * signal.factor + signal.offset)
}

fn extract_little_endian(frame_data: &[u8], first_bit: u32, size: u32) -> Option<u64> {
    let frame_bits = (frame_data.len() as u32) * 8;
    if first_bit + size > frame_bits {
        return None;
    }
    let start_byte = (first_bit / 8) as usize;
    let bit_offset = first_bit % 8;
    // An unaligned 64-bit window touches nine bytes.
    let num_bytes = ((bit_offset + size + 7) / 8) as usize;

    let mut value: u128 = 0;
    for (i, byte) in frame_data[start_byte..start_byte + num_bytes]
        .iter()
        .enumerate()
    {
        value |= u128::from(*byte) << (8 * i as u32);
    }
    Some(mask_to_size((value >> bit_offset) as u64, size))
}

fn extract_big_endian(frame_data: &[u8], first_bit: u32, size: u32) -> Option<u64> {
    let start_byte = (first_bit / 8) as usize;
    if start_byte >= frame_data.len() {
        return None;
    }
    let bit_offset = first_bit % 8;
    // Bits reachable walking backward from the start byte.
    let available = (8 - bit_offset) + (start_byte as u32) * 8;
    if size > available {
        return None;
    }

    let mut value: u64 = u64::from(frame_data[start_byte]) >> bit_offset;
    let mut bits_collected = 8 - bit_offset;
    let mut index = start_byte;
    while bits_collected < size {
        index -= 1;
        value |= u64::from(frame_data[index]) << bits_collected;
        bits_collected += 8;
    }
    Some(mask_to_size(value, size))
}

fn mask_to_size(value: u64, size: u32) -> u64 {
    if size >= 64 {
        value
    } else {
        value & ((1u64 << size) - 1)
    }
}

fn sign_extend(raw: u64, size: u32) -> i64 {
    if size >= 64 {
        return raw as i64;
    }
    let sign_bit = 1u64 << (size - 1);
    if raw & sign_bit != 0 {
        (raw | !((1u64 << size) - 1)) as i64
    } else {
        raw as i64
    }
}
