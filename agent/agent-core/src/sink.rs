//! Stand-in cloud sink.
//!
//! The production transport (MQTT client + credential provider) is an
//! external collaborator injected behind [`uplink::CloudSink`]. This build
//! wires a sink that accepts everything and logs message sizes, which keeps
//! the full pipeline exercisable on a bench without cloud credentials.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tracing::debug;
use uplink::{CloudSink, SendError};

#[derive(Default)]
pub struct LogOnlySink {
    telemetry_bytes: AtomicU64,
}

impl CloudSink for LogOnlySink {
    fn send_telemetry(
        &self,
        payload: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), SendError>> + Send>> {
        let total = self
            .telemetry_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed)
            + payload.len() as u64;
        debug!(bytes = payload.len(), total_bytes = total, "telemetry payload accepted");
        Box::pin(async { Ok(()) })
    }

    fn send_checkin(
        &self,
        payload: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), SendError>> + Send>> {
        debug!(bytes = payload.len(), "checkin accepted");
        Box::pin(async { Ok(()) })
    }

    fn is_alive(&self) -> bool {
        true
    }
}
