//! Raw CAN acquisition: one non-blocking socket per configured interface,
//! batched frame reads with kernel timestamps, and bit-exact signal
//! decoding against the active decoder dictionary.

pub mod decoder;
pub mod socket;
pub mod source;

use serde::Deserialize;

pub use socket::{CanFrameData, RawCanSocket, ReceivedFrame};
pub use source::CanDataSource;

/// Where frame timestamps come from.
///
/// Kernel timestamps are taken per frame from the socket's control messages;
/// polling falls back to reading the wall clock when the batch is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanTimestampMode {
    Polling,
    #[default]
    KernelSoftware,
    KernelHardware,
}

/// Per-interface acquisition settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CanSourceConfig {
    /// Linux network interface name, e.g. "can0".
    pub interface_name: String,
    /// Numeric channel id matching the decoder manifest's interface table.
    pub channel_id: u32,
    /// Fail instead of falling back to classic CAN when CAN-FD cannot be
    /// enabled on the socket.
    #[serde(default)]
    pub force_can_fd: bool,
    #[serde(default)]
    pub timestamp_mode: CanTimestampMode,
    /// Upper bound for the idle wait between empty reads.
    #[serde(default = "default_idle_time_ms")]
    pub idle_time_ms: u64,
}

fn default_idle_time_ms() -> u64 {
    50
}

/// Bus-level failures, split by whether the subsystem can keep running.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Interface down or unreachable: log and keep the socket.
    #[error("bus transient: {0}")]
    Transient(std::io::Error),
    /// Interface removed or socket unusable: the subsystem must shut down.
    #[error("bus fatal: {0}")]
    Fatal(std::io::Error),
}

impl BusError {
    pub(crate) fn from_errno(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENETDOWN) | Some(libc::ENETUNREACH) => BusError::Transient(err),
            _ => BusError::Fatal(err),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::Fatal(_))
    }
}
