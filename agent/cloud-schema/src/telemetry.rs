//! Telemetry payload: one triggered collection event on its way to the cloud.

use signal_core::{SignalId, Timestamp};

use crate::proto;
use crate::SyncId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySignal {
    pub signal_id: SignalId,
    pub timestamp_ms: Timestamp,
    pub value: f64,
}

/// Assembled event payload handed from the trigger engine to the uplink.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryPayload {
    pub scheme_id: SyncId,
    pub event_id: u32,
    pub event_time_ms: Timestamp,
    pub signals: Vec<TelemetrySignal>,
    pub dtcs: Option<Vec<String>>,
    pub persist: bool,
    pub compress: bool,
}

/// Serializes a payload, optionally Snappy-compressing the result.
///
/// Wire layout:
///   1 campaign_sync_id  2 event_id  3 event_time_ms
///   4 signals (repeated { 1 signal_id  2 timestamp_ms  3 double_value })
///   5 dtcs (repeated string)
///
/// Returns the bytes and whether they are compressed (compression is skipped
/// when it does not shrink the payload).
pub fn encode_telemetry(payload: &TelemetryPayload) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    proto::write_string_field(&mut buf, 1, &payload.scheme_id);
    proto::write_uint_field(&mut buf, 2, u64::from(payload.event_id));
    proto::write_uint_field(&mut buf, 3, payload.event_time_ms);
    for signal in &payload.signals {
        proto::write_message_field(&mut buf, 4, |inner| {
            proto::write_uint_field(inner, 1, u64::from(signal.signal_id));
            proto::write_uint_field(inner, 2, signal.timestamp_ms);
            proto::write_double_field(inner, 3, signal.value);
        });
    }
    if let Some(dtcs) = &payload.dtcs {
        for code in dtcs {
            proto::write_string_field(&mut buf, 5, code);
        }
    }

    if payload.compress {
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&buf)
            .unwrap_or_default();
        if !compressed.is_empty() && compressed.len() < buf.len() {
            return (compressed, true);
        }
    }
    (buf, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{
        read_double, read_len_delim, read_string, read_tag, read_varint, WIRE_LEN,
    };

    fn payload() -> TelemetryPayload {
        TelemetryPayload {
            scheme_id: "heartbeat".into(),
            event_id: 17,
            event_time_ms: 1_000,
            signals: vec![
                TelemetrySignal {
                    signal_id: 5,
                    timestamp_ms: 1_000,
                    value: 42.0,
                },
                TelemetrySignal {
                    signal_id: 6,
                    timestamp_ms: 999,
                    value: -1.5,
                },
            ],
            dtcs: Some(vec!["P0143".into()]),
            persist: false,
            compress: false,
        }
    }

    #[test]
    fn encodes_all_sections() {
        let (buf, compressed) = encode_telemetry(&payload());
        assert!(!compressed);

        let mut pos = 0;
        let mut signals = 0;
        let mut dtcs = Vec::new();
        let mut scheme_id = String::new();
        while pos < buf.len() {
            let (field, wire) = read_tag(&buf, &mut pos).unwrap();
            match (field, wire) {
                (1, WIRE_LEN) => scheme_id = read_string(&buf, &mut pos).unwrap(),
                (2, _) | (3, _) => {
                    read_varint(&buf, &mut pos).unwrap();
                }
                (4, WIRE_LEN) => {
                    let inner = read_len_delim(&buf, &mut pos).unwrap();
                    let mut ipos = 0;
                    let (_, _) = read_tag(inner, &mut ipos).unwrap();
                    read_varint(inner, &mut ipos).unwrap();
                    let (_, _) = read_tag(inner, &mut ipos).unwrap();
                    read_varint(inner, &mut ipos).unwrap();
                    let (_, _) = read_tag(inner, &mut ipos).unwrap();
                    read_double(inner, &mut ipos).unwrap();
                    signals += 1;
                }
                (5, WIRE_LEN) => dtcs.push(read_string(&buf, &mut pos).unwrap()),
                _ => panic!("unexpected field {field}"),
            }
        }
        assert_eq!(scheme_id, "heartbeat");
        assert_eq!(signals, 2);
        assert_eq!(dtcs, vec!["P0143"]);
    }

    #[test]
    fn compression_roundtrips() {
        let mut p = payload();
        p.compress = true;
        // Enough repetitive content that Snappy actually wins.
        p.signals = (0..256)
            .map(|i| TelemetrySignal {
                signal_id: 5,
                timestamp_ms: 1_000 + i,
                value: 42.0,
            })
            .collect();
        let (compressed, was_compressed) = encode_telemetry(&p);
        assert!(was_compressed);

        p.compress = false;
        let (plain, _) = encode_telemetry(&p);
        let decompressed = snap::raw::Decoder::new().decompress_vec(&compressed).unwrap();
        assert_eq!(decompressed, plain);
        assert!(compressed.len() < plain.len());
    }
}
