//! OBD-II acquisition over ISO-TP.
//!
//! One raw CAN socket broadcasts the discovery request; every responding ECU
//! gets its own ISO-TP socket with tx/rx ids derived from the response id.
//! The acquisition loop runs two independent timers (PID and DTC polling)
//! and partitions each requested PID to the first ECU that reports support
//! for it.
//!
//! The worker is blocking by design (ISO-TP request/response with short poll
//! timeouts) and is run on the runtime's blocking pool.

pub mod decoder;
pub mod ecu;
pub mod module;

use serde::Deserialize;

pub use module::ObdOverCanModule;

/// Service 01: show current data.
pub const SERVICE_CURRENT_DATA: u8 = 0x01;
/// Service 03: show stored diagnostic trouble codes.
pub const SERVICE_STORED_DTCS: u8 = 0x03;
/// Positive responses echo the service id plus this offset.
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// ISO 15765-4 functional broadcast ids.
pub const BROADCAST_ID_STANDARD: u32 = 0x7DF;
pub const BROADCAST_ID_EXTENDED: u32 = 0x18DB_33F1;

/// ECU response windows.
pub const LOWEST_RX_ID_STANDARD: u32 = 0x7E8;
pub const HIGHEST_RX_ID_STANDARD: u32 = 0x7EF;
pub const LOWEST_RX_ID_EXTENDED: u32 = 0x18DA_F100;
pub const HIGHEST_RX_ID_EXTENDED: u32 = 0x18DA_F1FF;

/// P2 response timeout per ISO 15765-2.
pub const P2_TIMEOUT_MS: u64 = 100;

/// Time between discovery retries when no ECU answered.
pub const DISCOVERY_RETRY_MS: u64 = 1_000;

#[derive(Debug, Clone, Deserialize)]
pub struct ObdConfig {
    /// CAN interface carrying diagnostics traffic, e.g. "can0".
    pub gateway_interface_name: String,
    /// 0 disables PID polling.
    #[serde(default)]
    pub pid_request_interval_seconds: u64,
    /// 0 disables DTC polling.
    #[serde(default)]
    pub dtc_request_interval_seconds: u64,
    /// Send requests once to the functional broadcast address instead of
    /// per-ECU physical requests.
    #[serde(default)]
    pub broadcast_requests: bool,
}

impl ObdConfig {
    /// The worker is only started when at least one timer is active.
    pub fn is_enabled(&self) -> bool {
        self.pid_request_interval_seconds > 0 || self.dtc_request_interval_seconds > 0
    }
}

/// Computes an ECU's physical tx id from its discovered rx id.
///
/// 11-bit: rx 0x7E8..0x7EF → tx = rx - 8.
/// 29-bit: rx 0x18DAF1nn → tx = 0x18DAnnF1.
pub fn tx_id_for_rx(rx_id: u32, extended: bool) -> u32 {
    if extended {
        0x18DA_00F1 | ((rx_id & 0xFF) << 8)
    } else {
        rx_id - 0x8
    }
}
