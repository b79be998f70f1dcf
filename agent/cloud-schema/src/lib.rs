//! Wire layer between the cloud and the agent.
//!
//! The cloud pushes two schema documents — the decoder manifest and the
//! collection scheme list — as protobuf binary blobs; the agent answers with
//! checkins and telemetry payloads. This crate owns the Rust models of those
//! documents and minimal hand-rolled protobuf codecs for them. The wire
//! payloads stay opaque to every other crate: callers hand in bytes and get
//! validated models back, or hand in models and get bytes.
//!
//! The codecs are intentionally tiny — varints, length-delimited fields and
//! fixed-width scalars — rather than generated code, mirroring how the rest
//! of the agent treats its framing.

pub mod checkin;
pub mod condition;
pub mod manifest;
pub mod proto;
pub mod schemes;
pub mod telemetry;

pub use checkin::encode_checkin;
pub use condition::{BinaryOp, ExpressionArena, ExpressionNode, NodeIndex, UnaryOp, WindowType};
pub use manifest::{
    CanSignalDecoder, ComplexSignalDecoder, CustomSignalDecoder, DecoderManifest, PidSignalDecoder,
    SignalProtocol,
};
pub use schemes::{
    CollectionScheme, CollectionSchemeList, FetchAction, FetchInformation, FetchTrigger,
    SignalInformation, TriggerMode,
};
pub use telemetry::{encode_telemetry, TelemetryPayload, TelemetrySignal};

/// Cloud-side synchronization identifier of a schema document.
pub type SyncId = String;

/// Errors for malformed or semantically invalid schema documents.
///
/// Any of these leaves the previously active artifacts untouched; the caller
/// counts the error and carries on.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("truncated field at byte {0}")]
    Truncated(usize),
    #[error("varint overflow at byte {0}")]
    VarintOverflow(usize),
    #[error("malformed document: {0}")]
    Malformed(&'static str),
    #[error("invalid decoder manifest: {0}")]
    InvalidManifest(String),
    #[error("invalid collection scheme {scheme_id}: {reason}")]
    InvalidScheme { scheme_id: SyncId, reason: String },
    #[error("inconsistent fixed window period for signal {signal_id}: {existing_ms} vs {requested_ms}")]
    InconsistentWindow {
        signal_id: signal_core::SignalId,
        existing_ms: u32,
        requested_ms: u32,
    },
}
