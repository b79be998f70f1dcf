//! Decoding of OBD-II responses: PID-packed signals, supported-PID bitmaps
//! and stored DTCs.

use policy_manager::PidSignalRule;
use signal_core::{Sample, SignalValue, Timestamp};
use tracing::warn;

use crate::{POSITIVE_RESPONSE_OFFSET, SERVICE_CURRENT_DATA, SERVICE_STORED_DTCS};

/// Extracts all signals of one PID from the response payload (the bytes
/// following the service id and PID echo).
pub fn decode_pid_payload(
    rules: &[PidSignalRule],
    payload: &[u8],
    timestamp_ms: Timestamp,
) -> Vec<Sample> {
    let mut samples = Vec::with_capacity(rules.len());
    for rule in rules {
        if payload.len() < rule.pid_response_length {
            warn!(
                pid = rule.pid,
                got = payload.len(),
                expected = rule.pid_response_length,
                "PID response shorter than decoder expects"
            );
            metrics::counter!("canflux.obd.decode_errors").increment(1);
            continue;
        }
        let bytes = &payload[rule.start_byte..rule.start_byte + rule.byte_length];
        let raw: u64 = if rule.byte_length == 1 {
            // Bit manipulation only applies to single-byte signals.
            let mask = if rule.bit_mask_length >= 8 {
                0xFF
            } else {
                (1u8 << rule.bit_mask_length) - 1
            };
            u64::from((bytes[0] >> rule.bit_right_shift) & mask)
        } else {
            bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
        };
        let physical = if rule.is_signed {
            let shift = 64 - (rule.byte_length * 8) as u32;
            (((raw << shift) as i64) >> shift) as f64
        } else {
            raw as f64
        };
        let value = physical * rule.scaling + rule.offset;
        samples.push(Sample::new(
            rule.signal_id,
            timestamp_ms,
            SignalValue::from_physical(value, rule.signal_type),
        ));
    }
    samples
}

/// Validates a service-01 response header. Returns the payload following
/// `[SID+0x40, pid]` or `None` for negative/foreign responses.
pub fn pid_response_payload<'a>(response: &'a [u8], pid: u8) -> Option<&'a [u8]> {
    if response.len() < 2 {
        return None;
    }
    if response[0] != SERVICE_CURRENT_DATA + POSITIVE_RESPONSE_OFFSET || response[1] != pid {
        return None;
    }
    Some(&response[2..])
}

/// Decodes a supported-PID bitmap response (PIDs `base+1 ..= base+0x20`).
/// Bit 7 of the first byte marks `base + 1`.
pub fn decode_supported_pids(base_pid: u8, bitmap: &[u8]) -> Vec<u8> {
    let mut supported = Vec::new();
    for (byte_index, byte) in bitmap.iter().take(4).enumerate() {
        for bit in 0..8u8 {
            if byte & (0x80 >> bit) != 0 {
                let offset = (byte_index as u8) * 8 + bit + 1;
                supported.push(base_pid + offset);
            }
        }
    }
    supported
}

/// True if the bitmap's last bit is set, i.e. the next range request
/// (`base + 0x20`) is itself supported.
pub fn next_range_supported(bitmap: &[u8]) -> bool {
    bitmap.get(3).is_some_and(|b| b & 0x01 != 0)
}

/// Decodes a service-03 response into DTC strings like "P0143".
///
/// Layout: `[0x43, count, hi, lo, hi, lo, ...]`.
pub fn decode_dtcs(response: &[u8]) -> Option<Vec<String>> {
    if response.first() != Some(&(SERVICE_STORED_DTCS + POSITIVE_RESPONSE_OFFSET)) {
        return None;
    }
    let mut codes = Vec::new();
    let payload = response.get(2..)?;
    let count = usize::from(*response.get(1)?);
    for chunk in payload.chunks_exact(2).take(count) {
        codes.push(format_dtc(chunk[0], chunk[1]));
    }
    Some(codes)
}

fn format_dtc(hi: u8, lo: u8) -> String {
    let letter = match hi >> 6 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    format!(
        "{letter}{:X}{:X}{:X}{:X}",
        (hi >> 4) & 0x3,
        hi & 0xF,
        lo >> 4,
        lo & 0xF
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_core::SignalType;

    fn rule(start_byte: usize, byte_length: usize, scaling: f64, offset: f64) -> PidSignalRule {
        PidSignalRule {
            signal_id: 1,
            pid: 0x0C,
            pid_response_length: 2,
            scaling,
            offset,
            start_byte,
            byte_length,
            bit_right_shift: 0,
            bit_mask_length: 8,
            is_signed: false,
            signal_type: SignalType::Double,
        }
    }

    #[test]
    fn engine_speed_two_byte_pid() {
        // PID 0x0C: rpm = ((A << 8) | B) / 4.
        let samples = decode_pid_payload(&[rule(0, 2, 0.25, 0.0)], &[0x1A, 0xF8], 5);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, SignalValue::Double(1726.0));
        assert_eq!(samples[0].timestamp_ms, 5);
    }

    #[test]
    fn bitmask_applies_only_to_single_byte() {
        // Bits 2..3 of the byte: shift 2, mask length 2.
        let mut r = rule(0, 1, 1.0, 0.0);
        r.pid_response_length = 1;
        r.bit_right_shift = 2;
        r.bit_mask_length = 2;
        let samples = decode_pid_payload(&[r], &[0b0000_1100], 0);
        assert_eq!(samples[0].value, SignalValue::Double(3.0));
    }

    #[test]
    fn short_response_is_skipped() {
        let samples = decode_pid_payload(&[rule(0, 2, 1.0, 0.0)], &[0x55], 0);
        assert!(samples.is_empty());
    }

    #[test]
    fn response_header_is_validated() {
        assert_eq!(pid_response_payload(&[0x41, 0x0C, 1, 2], 0x0C), Some(&[1u8, 2u8][..]));
        // Wrong PID echo.
        assert_eq!(pid_response_payload(&[0x41, 0x0D, 1, 2], 0x0C), None);
        // Negative response.
        assert_eq!(pid_response_payload(&[0x7F, 0x01, 0x11], 0x0C), None);
        assert_eq!(pid_response_payload(&[0x41], 0x0C), None);
    }

    #[test]
    fn supported_pid_bitmap() {
        // 0xBE1FA813: a realistic PID 0x00 answer.
        let supported = decode_supported_pids(0x00, &[0xBE, 0x1F, 0xA8, 0x13]);
        assert!(supported.contains(&0x01));
        assert!(!supported.contains(&0x02));
        assert!(supported.contains(&0x0C));
        assert!(supported.contains(&0x20));
        assert!(next_range_supported(&[0xBE, 0x1F, 0xA8, 0x13]));
        assert!(!next_range_supported(&[0xBE, 0x1F, 0xA8, 0x12]));
    }

    #[test]
    fn bitmap_offsets_follow_base() {
        let supported = decode_supported_pids(0x20, &[0x80, 0, 0, 0]);
        assert_eq!(supported, vec![0x21]);
    }

    #[test]
    fn dtc_formatting() {
        assert_eq!(format_dtc(0x01, 0x43), "P0143");
        assert_eq!(format_dtc(0x41, 0x23), "C0123");
        assert_eq!(format_dtc(0x81, 0x00), "B0100");
        assert_eq!(format_dtc(0xC1, 0xFF), "U01FF");
    }

    #[test]
    fn dtc_response_parsing() {
        let codes = decode_dtcs(&[0x43, 0x02, 0x01, 0x43, 0x41, 0x23]).unwrap();
        assert_eq!(codes, vec!["P0143", "C0123"]);
        // No stored DTCs is a valid, empty answer.
        assert_eq!(decode_dtcs(&[0x43, 0x00]), Some(vec![]));
        // Foreign service id.
        assert_eq!(decode_dtcs(&[0x41, 0x0C]), None);
    }
}
