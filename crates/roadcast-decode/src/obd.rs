//! OBD-II response decoding
//!
//! Decodes positive responses to mode-1 PID requests, supported-PID
//! bitmasks, stored DTCs, and the VIN. PID decoding rules normally come
//! from the cloud decoder manifest (projected into the dictionary); a
//! built-in response-length table keeps trailing PIDs decodable when a
//! response batches a PID the dictionary does not know.

use roadcast_core::manifest::CanMessageFormat;
use roadcast_core::signal::{SignalId, SignalValue};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// OBD-II parameter ID within a service mode.
pub type Pid = u8;

/// Positive responses carry `0x40 + SID` as their first byte.
pub const POSITIVE_ECU_RESPONSE_BASE: u8 = 0x40;

pub const SERVICE_MODE_CURRENT_DATA: u8 = 0x01;
pub const SERVICE_MODE_STORED_DTC: u8 = 0x03;
pub const SERVICE_MODE_VEHICLE_INFO: u8 = 0x09;

/// InfoType of the VIN request in service mode 9.
pub const VEHICLE_IDENTIFICATION_NUMBER_PID: Pid = 0x02;

/// First and last mode-1 PID covered by the fallback length table.
const FALLBACK_FIRST_PID: Pid = 0x03;
const FALLBACK_LAST_PID: Pid = 0xA6;

/// Expected response lengths of mode-1 PIDs `0x00..=0xA6` (J1979). Used only
/// to advance past PIDs missing from the decoder dictionary.
#[rustfmt::skip]
const MODE1_RESPONSE_LENGTHS: [u8; 0xA7] = [
    // 0x00 - 0x1F
    4, 4, 2, 2, 1, 1, 1, 1, 1, 1, 1, 1, 2, 1, 1, 1,
    2, 1, 1, 1, 2, 2, 2, 2, 2, 2, 2, 2, 1, 1, 1, 2,
    // 0x20 - 0x3F
    4, 2, 2, 2, 4, 4, 4, 4, 4, 4, 4, 4, 1, 1, 1, 1,
    1, 2, 2, 1, 4, 4, 4, 4, 4, 4, 4, 4, 2, 2, 2, 2,
    // 0x40 - 0x5F
    4, 4, 2, 2, 2, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 4,
    4, 1, 1, 2, 2, 2, 2, 2, 2, 2, 1, 1, 1, 2, 2, 1,
    // 0x60 - 0x7F
    4, 1, 1, 2, 5, 2, 5, 3, 7, 7, 5, 5, 5, 11, 9, 3,
    10, 6, 5, 5, 5, 7, 7, 5, 9, 9, 7, 7, 9, 1, 1, 13,
    // 0x80 - 0x9F
    4, 21, 21, 9, 1, 10, 5, 5, 13, 41, 41, 7, 17, 1, 1, 5,
    3, 5, 2, 3, 12, 0, 0, 0, 9, 9, 6, 4, 17, 4, 2, 9,
    // 0xA0 - 0xA6
    4, 9, 2, 9, 4, 4, 4,
];

/// Signal values decoded from one (possibly batched) PID response.
#[derive(Clone, Debug, Default)]
pub struct EmissionInfo {
    pub sid: u8,
    pub values: HashMap<SignalId, SignalValue>,
}

/// Stored diagnostic trouble codes of one ECU response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DtcInfo {
    pub sid: u8,
    pub codes: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ObdDecodeError {
    #[error("Not a positive ECU response for the requested service")]
    InvalidResponse,
    #[error("No decoder dictionary set")]
    NoDecoderDictionary,
    #[error("No signals decoded from response")]
    NoData,
}

/// Decoder for OBD-II PDUs. Runs on the single OBD ingest thread; the
/// dictionary reference is swapped whole on campaign changes.
#[derive(Debug, Default)]
pub struct ObdDataDecoder {
    /// PID -> generic frame format, as produced by the dictionary extractor
    /// for the synthetic OBD channel.
    dictionary: Option<Arc<HashMap<Pid, CanMessageFormat>>>,
}

impl ObdDataDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_decoder_dictionary(&mut self, dictionary: Arc<HashMap<Pid, CanMessageFormat>>) {
        self.dictionary = Some(dictionary);
    }

    /// Decode a positive response `[0x40+SID, PID, data..., PID, data...]`.
    /// Unknown PIDs are skipped by their fallback length so later PIDs in
    /// the batch still decode.
    pub fn decode_emission_pids(
        &self,
        sid: u8,
        response: &[u8],
    ) -> Result<EmissionInfo, ObdDecodeError> {
        if response.len() < 3 || response[0] != POSITIVE_ECU_RESPONSE_BASE.wrapping_add(sid) {
            return Err(ObdDecodeError::InvalidResponse);
        }
        let dictionary = self
            .dictionary
            .as_ref()
            .ok_or(ObdDecodeError::NoDecoderDictionary)?;

        let mut info = EmissionInfo {
            sid,
            values: HashMap::new(),
        };
        let mut byte_counter = 1usize;
        while byte_counter < response.len() {
            let pid = response[byte_counter];
            byte_counter += 1;
            if let Some(format) = dictionary.get(&pid) {
                let expected = format.size_in_bytes as usize;
                if byte_counter + expected <= response.len() {
                    for formula in &format.signals {
                        if !formula_is_valid(formula, expected) {
                            continue;
                        }
                        let physical =
                            extract_pid_signal(response, byte_counter, formula);
                        info.values.insert(
                            formula.signal_id,
                            SignalValue::from_physical(physical, formula.signal_type),
                        );
                    }
                }
                byte_counter += expected;
            } else if (FALLBACK_FIRST_PID..=FALLBACK_LAST_PID).contains(&pid) {
                byte_counter += MODE1_RESPONSE_LENGTHS[pid as usize] as usize;
                trace!(pid, "Decoder dictionary missing PID, skipping by fallback length");
            } else {
                trace!(pid, "Cannot decode PID");
            }
        }
        if info.values.is_empty() {
            return Err(ObdDecodeError::NoData);
        }
        Ok(info)
    }

    /// Decode a supported-PID bitmask response (PIDs 0x00, 0x20, 0x40, ...):
    /// `[0x40+SID, range, 4 bytes, range, 4 bytes, ...]`. Range PIDs
    /// themselves are excluded from the result, which is sorted.
    pub fn decode_supported_pids(
        &self,
        sid: u8,
        response: &[u8],
    ) -> Result<Vec<Pid>, ObdDecodeError> {
        if response.len() < 6 || response[0] != POSITIVE_ECU_RESPONSE_BASE.wrapping_add(sid) {
            return Err(ObdDecodeError::InvalidResponse);
        }
        let mut supported = Vec::new();
        let mut base_pid_count = 0usize;
        for i in 1..response.len() {
            // The requested range PID repeats every five bytes.
            if i % 5 == 1 {
                base_pid_count += 1;
                continue;
            }
            for bit in 0..8usize {
                if response[i] & (1 << bit) == 0 {
                    continue;
                }
                let index = (i - base_pid_count) * 8 - bit;
                if index > FALLBACK_LAST_PID as usize {
                    continue;
                }
                let pid = index as Pid;
                // Keep supported-PID range IDs out of the data PID list.
                if pid % 0x20 == 0 {
                    continue;
                }
                supported.push(pid);
            }
        }
        if supported.is_empty() {
            return Err(ObdDecodeError::NoData);
        }
        supported.sort_unstable();
        Ok(supported)
    }

    /// Decode a stored-DTC response `[0x40+SID, count, 2 bytes per code]`.
    /// Zero stored codes is a valid, empty result.
    pub fn decode_dtcs(&self, sid: u8, response: &[u8]) -> Result<DtcInfo, ObdDecodeError> {
        if response.len() < 2 || response[0] != POSITIVE_ECU_RESPONSE_BASE.wrapping_add(sid) {
            return Err(ObdDecodeError::InvalidResponse);
        }
        let mut info = DtcInfo {
            sid,
            codes: Vec::new(),
        };
        let dtc_count = response[1] as usize;
        if dtc_count == 0 {
            return Ok(info);
        }
        if dtc_count * 2 + 2 != response.len() {
            return Err(ObdDecodeError::InvalidResponse);
        }
        for pair in response[2..].chunks_exact(2) {
            info.codes.push(extract_dtc_string(pair[0], pair[1]));
        }
        if info.codes.is_empty() {
            return Err(ObdDecodeError::NoData);
        }
        Ok(info)
    }

    /// Decode a VIN response `[0x49, 0x02, item count, ascii...]`.
    pub fn decode_vin(&self, response: &[u8]) -> Result<String, ObdDecodeError> {
        if response.len() < 3
            || response[0]
                != POSITIVE_ECU_RESPONSE_BASE.wrapping_add(SERVICE_MODE_VEHICLE_INFO)
            || response[1] != VEHICLE_IDENTIFICATION_NUMBER_PID
        {
            return Err(ObdDecodeError::InvalidResponse);
        }
        let vin = String::from_utf8_lossy(&response[3..]).into_owned();
        if vin.is_empty() {
            return Err(ObdDecodeError::NoData);
        }
        Ok(vin)
    }
}

/// A formula is usable when its bit window lies within the PID response and
/// windows of one byte or more are byte aligned.
fn formula_is_valid(
    formula: &roadcast_core::manifest::CanSignalFormat,
    response_length: usize,
) -> bool {
    let first_bit = formula.first_bit_position as usize;
    let size = formula.size_in_bits as usize;
    let total_bits = response_length * 8;
    first_bit < total_bits
        && first_bit + size <= total_bits
        && (size < 8 || (size % 8 == 0 && first_bit % 8 == 0))
}

fn extract_pid_signal(
    response: &[u8],
    byte_counter: usize,
    formula: &roadcast_core::manifest::CanSignalFormat,
) -> f64 {
    let first_bit = formula.first_bit_position as usize;
    let size = formula.size_in_bits as usize;
    let byte_index = byte_counter + first_bit / 8;
    let raw: u64 = if size < 8 {
        // Sub-byte signal: shift down then mask.
        let shifted = response[byte_index] >> (first_bit % 8);
        u64::from(shifted & (0xFF >> (8 - size)))
    } else {
        // Whole bytes, most significant first.
        response[byte_index..byte_index + size / 8]
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
    };
    raw as f64 * formula.factor + formula.offset
}

/// J1979 §8.3.1: the top two bits select the domain letter, the remaining
/// fourteen bits form four hex digits.
fn extract_dtc_string(first_byte: u8, second_byte: u8) -> String {
    let domain = match first_byte >> 6 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    format!(
        "{}{:X}{:X}{:X}{:X}",
        domain,
        (first_byte & 0x30) >> 4,
        first_byte & 0x0F,
        second_byte >> 4,
        second_byte & 0x0F
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use roadcast_core::manifest::CanSignalFormat;
    use roadcast_core::signal::SignalType;

    /// PID formula in the manifest's (start byte, shift, mask length) shape,
    /// converted the way the dictionary extractor does.
    fn pid_formula(
        signal_id: SignalId,
        start_byte: u16,
        byte_length: u16,
        bit_right_shift: u16,
        bit_mask_length: u16,
        factor: f64,
        offset: f64,
    ) -> CanSignalFormat {
        CanSignalFormat {
            signal_id,
            first_bit_position: start_byte * 8 + bit_right_shift,
            size_in_bits: (byte_length - 1) * 8 + bit_mask_length,
            factor,
            offset,
            signal_type: SignalType::F64,
            ..Default::default()
        }
    }

    fn decoder_with(formats: Vec<(Pid, u8, Vec<CanSignalFormat>)>) -> ObdDataDecoder {
        let mut dictionary = HashMap::new();
        for (pid, response_length, signals) in formats {
            dictionary.insert(
                pid,
                CanMessageFormat {
                    message_id: u32::from(pid),
                    size_in_bytes: response_length,
                    signals,
                },
            );
        }
        let mut decoder = ObdDataDecoder::new();
        decoder.set_decoder_dictionary(Arc::new(dictionary));
        decoder
    }

    #[test]
    fn test_engine_load() {
        let decoder = decoder_with(vec![(
            0x04,
            1,
            vec![pid_formula(100, 0, 1, 0, 8, 100.0 / 255.0, 0.0)],
        )]);
        let info = decoder
            .decode_emission_pids(SERVICE_MODE_CURRENT_DATA, &[0x41, 0x04, 0x99])
            .unwrap();
        assert_eq!(info.values.get(&100).unwrap().as_f64().unwrap(), 60.0);
    }

    #[test]
    fn test_boost_pressure_control_multi_signal() {
        let signals = vec![
            pid_formula(200, 0, 1, 0, 8, 1.0, 0.0),
            pid_formula(201, 1, 2, 0, 8, 0.03125, 0.0),
            pid_formula(202, 3, 2, 0, 8, 0.03125, 0.0),
            pid_formula(203, 5, 2, 0, 8, 0.03125, 0.0),
            pid_formula(204, 7, 2, 0, 8, 0.03125, 0.0),
            pid_formula(205, 9, 1, 0, 2, 1.0, 0.0),
            pid_formula(206, 9, 1, 2, 2, 1.0, 0.0),
            pid_formula(207, 9, 1, 4, 4, 1.0, 0.0),
        ];
        let decoder = decoder_with(vec![(0x70, 10, signals)]);
        let response = [
            0x41, 0x70, 0x3F, 0x64, 0x64, 0x64, 0x64, 0x64, 0x64, 0x64, 0x64, 0x0F,
        ];
        let info = decoder
            .decode_emission_pids(SERVICE_MODE_CURRENT_DATA, &response)
            .unwrap();
        assert_eq!(info.values.get(&200).unwrap().as_f64().unwrap(), 0x3F as f64);
        for id in [201, 202, 203, 204] {
            assert_eq!(info.values.get(&id).unwrap().as_f64().unwrap(), 803.125);
        }
        assert_eq!(info.values.get(&205).unwrap().as_f64().unwrap(), 3.0);
        assert_eq!(info.values.get(&206).unwrap().as_f64().unwrap(), 3.0);
        assert_eq!(info.values.get(&207).unwrap().as_f64().unwrap(), 0.0);
    }

    #[test]
    fn test_batched_pids_skip_unknown_by_fallback_length() {
        // PID 0x05 is not in the dictionary (1 byte fallback); PID 0x0D after
        // it must still decode.
        let decoder = decoder_with(vec![(
            0x0D,
            1,
            vec![pid_formula(300, 0, 1, 0, 8, 1.0, 0.0)],
        )]);
        let info = decoder
            .decode_emission_pids(SERVICE_MODE_CURRENT_DATA, &[0x41, 0x05, 0x5A, 0x0D, 0x40])
            .unwrap();
        assert_eq!(info.values.len(), 1);
        assert_eq!(info.values.get(&300).unwrap().as_f64().unwrap(), 64.0);
    }

    #[test]
    fn test_negative_response_rejected() {
        let decoder = decoder_with(vec![]);
        let result = decoder.decode_emission_pids(SERVICE_MODE_CURRENT_DATA, &[0x7F, 0x01, 0x12]);
        assert!(matches!(result, Err(ObdDecodeError::InvalidResponse)));
    }

    #[test]
    fn test_formula_window_must_fit_response() {
        // 2-byte window in a 1-byte response is dropped.
        let decoder = decoder_with(vec![(
            0x04,
            1,
            vec![pid_formula(100, 0, 2, 0, 8, 1.0, 0.0)],
        )]);
        let result = decoder.decode_emission_pids(SERVICE_MODE_CURRENT_DATA, &[0x41, 0x04, 0x99]);
        assert!(matches!(result, Err(ObdDecodeError::NoData)));
    }

    #[test]
    fn test_supported_pid_bitmasks() {
        let decoder = decoder_with(vec![]);
        // 0x00 range: 0xBE 0x1F 0xA8 0x13 -> a common supported set
        let response = [0x41, 0x00, 0xBE, 0x1F, 0xA8, 0x13];
        let supported = decoder
            .decode_supported_pids(SERVICE_MODE_CURRENT_DATA, &response)
            .unwrap();
        // 0xBE = 0b10111110: PIDs 1,3,4,5,6,7 (bit 7 -> PID 1, bit 0 unset)
        assert!(supported.contains(&0x01));
        assert!(supported.contains(&0x03));
        assert!(supported.contains(&0x07));
        assert!(!supported.contains(&0x02));
        assert!(!supported.contains(&0x08));
        // 0xA8 in the third data byte: PIDs 0x11, 0x13, 0x15
        assert!(supported.contains(&0x11));
        assert!(supported.contains(&0x15));
        // 0x13 in the fourth data byte: PIDs 0x1C, 0x1F (plus the excluded 0x20)
        assert!(supported.contains(&0x1C));
        assert!(supported.contains(&0x1F));
        // Range PIDs never appear.
        assert!(!supported.contains(&0x00));
        assert!(!supported.contains(&0x20));
        let mut sorted = supported.clone();
        sorted.sort_unstable();
        assert_eq!(supported, sorted);
    }

    #[test]
    fn test_dtc_domains_and_digits() {
        let decoder = decoder_with(vec![]);
        let response = [0x43, 0x04, 0x01, 0x43, 0x41, 0x96, 0x81, 0x48, 0xC1, 0x48];
        let info = decoder
            .decode_dtcs(SERVICE_MODE_STORED_DTC, &response)
            .unwrap();
        assert_eq!(info.codes, vec!["P0143", "C0196", "B0148", "U0148"]);
    }

    #[test]
    fn test_dtc_zero_count_is_valid() {
        let decoder = decoder_with(vec![]);
        let info = decoder
            .decode_dtcs(SERVICE_MODE_STORED_DTC, &[0x43, 0x00])
            .unwrap();
        assert!(info.codes.is_empty());
    }

    #[test]
    fn test_dtc_corrupt_length_rejected() {
        let decoder = decoder_with(vec![]);
        let result = decoder.decode_dtcs(SERVICE_MODE_STORED_DTC, &[0x43, 0x02, 0x01, 0x43]);
        assert!(matches!(result, Err(ObdDecodeError::InvalidResponse)));
    }

    #[test]
    fn test_vin_decode() {
        let decoder = decoder_with(vec![]);
        let mut response = vec![0x49, 0x02, 0x01];
        response.extend_from_slice(b"1HGBH41JXMN109186");
        let vin = decoder.decode_vin(&response).unwrap();
        assert_eq!(vin, "1HGBH41JXMN109186");
    }
}
