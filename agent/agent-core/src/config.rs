//! Agent configuration loaded from a YAML file.
//!
//! File location: /etc/canflux/agent.yaml (default)
//! Override via environment: CANFLUX_CONFIG=/path/to/agent.yaml

use can_adapter::CanSourceConfig;
use obd_adapter::ObdConfig;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    /// Identifier of this vehicle, used in logs only; the cloud identifies
    /// the device through the connectivity collaborator.
    pub vehicle_id: String,

    /// CAN interfaces to read raw frames from.
    #[serde(default)]
    pub can_interfaces: Vec<CanInterfaceConfig>,

    /// OBD-II acquisition over the diagnostics gateway interface.
    pub obd: Option<ObdConfig>,

    /// Directory for persisted schemas and undelivered payloads.
    #[serde(default = "default_persistency_path")]
    pub persistency_path: std::path::PathBuf,

    /// Retry cadence for re-sending persisted payloads. 0 disables the
    /// timer (the backlog is still attempted once on startup).
    #[serde(default = "default_persistency_retry_ms")]
    pub persistency_upload_retry_interval_ms: u64,

    /// Rate limit for checkin messages.
    #[serde(default = "default_checkin_interval_ms")]
    pub checkin_interval_ms: u64,

    /// Upper bound for the policy manager's timed wait.
    #[serde(default = "default_idle_time_ms")]
    pub idle_time_ms: u64,

    /// Capacity of the decoded-sample queue in frames.
    #[serde(default = "default_signal_buffer_size")]
    pub signal_buffer_size: usize,

    /// Capacity of the outbound payload queue.
    #[serde(default = "default_payload_queue_size")]
    pub payload_queue_size: usize,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One raw CAN interface plus its cloud-side identity.
#[derive(Debug, Clone, Deserialize)]
pub struct CanInterfaceConfig {
    /// Interface id as referenced by decoder manifests.
    pub interface_id: String,
    #[serde(flatten)]
    pub source: CanSourceConfig,
}

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    /// Bind address for the Prometheus scrape endpoint.
    #[serde(default = "default_metrics_addr")]
    pub bind_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_metrics_addr(),
        }
    }
}

fn default_persistency_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/canflux")
}
fn default_persistency_retry_ms() -> u64 {
    10_000
}
fn default_checkin_interval_ms() -> u64 {
    120_000
}
fn default_idle_time_ms() -> u64 {
    1_000
}
fn default_signal_buffer_size() -> usize {
    2_048
}
fn default_payload_queue_size() -> usize {
    256
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9598".to_string()
}

impl AgentConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config_path =
            std::env::var("CANFLUX_CONFIG").unwrap_or_else(|_| "/etc/canflux/agent.yaml".to_string());
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("cannot read config file {config_path}: {e}"))?;
        Self::parse(&content).map_err(|e| anyhow::anyhow!("invalid config file {config_path}: {e}"))
    }

    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}
