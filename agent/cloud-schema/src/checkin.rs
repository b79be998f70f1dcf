//! Checkin message: periodic acknowledgment of the schema documents the
//! agent currently holds.

use signal_core::Timestamp;

use crate::proto;
use crate::SyncId;

/// Encodes a checkin listing `document_sync_ids` at `timestamp_ms`.
///
/// Wire layout: 1 timestamp_ms_epoch (varint), 2 document_sync_ids (repeated
/// string).
pub fn encode_checkin(timestamp_ms: Timestamp, document_sync_ids: &[SyncId]) -> Vec<u8> {
    let mut buf = Vec::new();
    proto::write_uint_field(&mut buf, 1, timestamp_ms);
    for id in document_sync_ids {
        proto::write_string_field(&mut buf, 2, id);
    }
    buf
}
