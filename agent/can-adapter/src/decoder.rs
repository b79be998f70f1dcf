//! Bit-exact extraction of signals from CAN payloads.
//!
//! Bit numbering convention:
//! - little-endian signals: bit index `b` addresses byte `b / 8`, bit
//!   `b % 8` (LSB-first); `start_bit` is the signal's least significant bit.
//! - big-endian signals: bit index `b` addresses byte `b / 8`, bit
//!   `7 - b % 8` (MSB-first); `start_bit` is the signal's most significant
//!   bit and the signal occupies the following bits in stream order.

use policy_manager::{CanDecoderDictionary, CanSignalRule};
use signal_core::{RawSignalType, Sample, SignalValue, Timestamp};

/// Extracts the raw (unscaled) bit pattern of one signal.
fn extract_raw(payload: &[u8], start_bit: u16, length: u16, big_endian: bool) -> Option<u64> {
    let start = start_bit as usize;
    let len = length as usize;
    if len == 0 || len > 64 || start + len > payload.len() * 8 {
        return None;
    }
    let mut raw = 0u64;
    if big_endian {
        for bit in start..start + len {
            let byte = payload[bit / 8];
            let bit_value = (byte >> (7 - (bit % 8))) & 1;
            raw = (raw << 1) | u64::from(bit_value);
        }
    } else {
        for (out_pos, bit) in (start..start + len).enumerate() {
            let byte = payload[bit / 8];
            let bit_value = (byte >> (bit % 8)) & 1;
            raw |= u64::from(bit_value) << out_pos;
        }
    }
    Some(raw)
}

fn sign_extend(raw: u64, length: u16) -> i64 {
    if length == 64 {
        return raw as i64;
    }
    let shift = 64 - length as u32;
    ((raw << shift) as i64) >> shift
}

/// Decodes one signal according to its rule. Returns `None` when the rule
/// does not fit the payload (shorter frame than the manifest assumed).
pub fn decode_signal(rule: &CanSignalRule, payload: &[u8]) -> Option<SignalValue> {
    let raw = extract_raw(payload, rule.start_bit, rule.length, rule.is_big_endian)?;
    let physical = match rule.raw_signal_type {
        RawSignalType::FloatingPoint => match rule.length {
            32 => f64::from(f32::from_bits(raw as u32)),
            64 => f64::from_bits(raw),
            _ => return None,
        },
        RawSignalType::Integer => {
            if rule.is_signed {
                sign_extend(raw, rule.length) as f64
            } else {
                raw as f64
            }
        }
    };
    let scaled = physical * rule.factor + rule.offset;
    Some(SignalValue::from_physical(scaled, rule.signal_type))
}

/// Decodes a whole frame against the dictionary. Frames without rules are
/// rejected with a single hash lookup.
pub fn decode_frame(
    dictionary: &CanDecoderDictionary,
    channel_id: u32,
    frame_id: u32,
    payload: &[u8],
    timestamp_ms: Timestamp,
) -> Option<Vec<Sample>> {
    let rules = dictionary.rules_for(channel_id, frame_id)?;
    let mut samples = Vec::with_capacity(rules.len());
    for rule in rules {
        if let Some(value) = decode_signal(rule, payload) {
            samples.push(Sample::new(rule.signal_id, timestamp_ms, value));
        } else {
            metrics::counter!("canflux.can.decode_errors").increment(1);
        }
    }
    Some(samples)
}

/// Writes a raw bit pattern into a payload; inverse of [`extract_raw`].
/// Used by the loopback tests and kept next to the decoder so both sides
/// share one bit-numbering convention.
pub fn encode_raw(payload: &mut [u8], start_bit: u16, length: u16, big_endian: bool, raw: u64) {
    let start = start_bit as usize;
    let len = length as usize;
    if big_endian {
        for (i, bit) in (start..start + len).enumerate() {
            let bit_value = ((raw >> (len - 1 - i)) & 1) as u8;
            let mask = 1 << (7 - (bit % 8));
            if bit_value != 0 {
                payload[bit / 8] |= mask;
            } else {
                payload[bit / 8] &= !mask;
            }
        }
    } else {
        for (i, bit) in (start..start + len).enumerate() {
            let bit_value = ((raw >> i) & 1) as u8;
            let mask = 1 << (bit % 8);
            if bit_value != 0 {
                payload[bit / 8] |= mask;
            } else {
                payload[bit / 8] &= !mask;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_core::SignalType;
    use std::collections::HashMap;

    fn rule(start_bit: u16, length: u16, big_endian: bool, signed: bool) -> CanSignalRule {
        CanSignalRule {
            signal_id: 1,
            start_bit,
            length,
            is_big_endian: big_endian,
            is_signed: signed,
            factor: 1.0,
            offset: 0.0,
            signal_type: SignalType::Double,
            raw_signal_type: RawSignalType::Integer,
        }
    }

    #[test]
    fn little_endian_byte_aligned() {
        // Unsigned byte at bits [0..7].
        let payload = [0x2A, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            decode_signal(&rule(0, 8, false, false), &payload),
            Some(SignalValue::Double(42.0))
        );
    }

    #[test]
    fn little_endian_crosses_byte_boundary() {
        // 12-bit value 0xABC starting at bit 4.
        let mut payload = [0u8; 8];
        encode_raw(&mut payload, 4, 12, false, 0xABC);
        let decoded = decode_signal(&rule(4, 12, false, false), &payload).unwrap();
        assert_eq!(decoded, SignalValue::Double(0xABC as f64));
    }

    #[test]
    fn big_endian_msb_first() {
        // Big-endian 16-bit starting at bit 0: bytes 0..1 as BE integer.
        let payload = [0x12, 0x34, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            decode_signal(&rule(0, 16, true, false), &payload),
            Some(SignalValue::Double(0x1234 as f64))
        );
    }

    #[test]
    fn signed_values_sign_extend() {
        let mut payload = [0u8; 8];
        // -5 as a 10-bit two's complement value.
        let raw = ((-5i64) as u64) & 0x3FF;
        encode_raw(&mut payload, 3, 10, false, raw);
        assert_eq!(
            decode_signal(&rule(3, 10, false, true), &payload),
            Some(SignalValue::Double(-5.0))
        );
    }

    #[test]
    fn scale_and_offset_apply() {
        let mut r = rule(0, 8, false, false);
        r.factor = 0.5;
        r.offset = -40.0;
        let payload = [100, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode_signal(&r, &payload), Some(SignalValue::Double(10.0)));
    }

    #[test]
    fn raw_float_bit_pattern() {
        let mut r = rule(0, 32, false, false);
        r.raw_signal_type = RawSignalType::FloatingPoint;
        let mut payload = [0u8; 8];
        encode_raw(&mut payload, 0, 32, false, u64::from(1.5f32.to_bits()));
        assert_eq!(decode_signal(&r, &payload), Some(SignalValue::Double(1.5)));
    }

    #[test]
    fn rule_beyond_payload_is_rejected() {
        let payload = [0u8; 2];
        assert_eq!(decode_signal(&rule(8, 16, false, false), &payload), None);
    }

    #[test]
    fn roundtrip_many_shapes() {
        // Encode then decode across byte orders, offsets and widths.
        for &(start, len, big_endian) in &[
            (0u16, 1u16, false),
            (5, 3, false),
            (0, 8, true),
            (12, 11, true),
            (16, 32, false),
            (0, 64, false),
            (0, 64, true),
            (7, 17, true),
        ] {
            let max = if len == 64 { u64::MAX } else { (1u64 << len) - 1 };
            for raw in [0u64, 1, max / 2, max] {
                let mut payload = [0u8; 8];
                encode_raw(&mut payload, start, len, big_endian, raw);
                let got = extract_raw(&payload, start, len, big_endian).unwrap();
                assert_eq!(got, raw, "start={start} len={len} be={big_endian}");
            }
        }
    }

    #[test]
    fn frame_without_rules_is_dropped_fast() {
        let dictionary = CanDecoderDictionary {
            frames: HashMap::new(),
            signal_ids_to_collect: Default::default(),
        };
        assert!(decode_frame(&dictionary, 0, 0x100, &[0u8; 8], 0).is_none());
    }

    #[test]
    fn frame_with_rules_yields_samples() {
        let mut frames = HashMap::new();
        let mut by_frame = HashMap::new();
        by_frame.insert(0x100u32, vec![rule(0, 8, false, false)]);
        frames.insert(10u32, by_frame);
        let dictionary = CanDecoderDictionary {
            frames,
            signal_ids_to_collect: Default::default(),
        };
        let samples = decode_frame(&dictionary, 10, 0x100, &[7, 0, 0, 0, 0, 0, 0, 0], 55).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].timestamp_ms, 55);
        assert_eq!(samples[0].value, SignalValue::Double(7.0));
    }
}
