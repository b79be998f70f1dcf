//! Cloud-facing services: payload sending with persistence-backed retry,
//! checkin emission, and the blob store used for schemas and undelivered
//! payloads.
//!
//! The actual transport (MQTT client, credentials, TLS) is an external
//! collaborator reached through the narrow [`CloudSink`] interface; this
//! crate never sees connection details, only send outcomes.

pub mod checkin;
pub mod persistence;
pub mod sender;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

pub use checkin::CheckinSender;
pub use persistence::{BlobStore, FileBlobStore, PayloadMetadata, PersistenceError, SchemaKind};
pub use sender::SenderWorker;

/// Failure to hand a message to the transport.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("transport not connected")]
    NotConnected,
    #[error("transport rejected message: {0}")]
    Rejected(String),
}

/// The narrow send/receive surface of the connectivity collaborator.
///
/// Implementations must not block: `send_*` returns a future that resolves
/// once the transport has accepted (not necessarily delivered) the message.
pub trait CloudSink: Send + Sync + 'static {
    fn send_telemetry(
        &self,
        payload: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), SendError>> + Send>>;

    fn send_checkin(
        &self,
        payload: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), SendError>> + Send>>;

    /// Whether the transport currently believes it is connected. Drives the
    /// persisted-payload retry.
    fn is_alive(&self) -> bool;
}
