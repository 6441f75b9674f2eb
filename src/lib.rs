pub mod agent;
pub mod bridge;
pub mod config;
pub mod queue;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One sampled snapshot of a device's host metrics.
///
/// This is the wire format published to `devices/{device_id}/metrics` and the
/// payload carried end-to-end through the queue, the bridge and the WebSocket
/// feed. Percent fields are in `[0, 100]`; `None` means the sensor is not
/// available on that device (e.g. no GPU).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub device_id: String,

    /// Capture instant, serialized as epoch seconds.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,

    pub cpu_percent: Option<f64>,
    pub mem_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub gpu_percent: Option<f64>,

    /// The agent's own resource footprint (self-monitoring).
    #[serde(default)]
    pub agent_metrics: AgentMetrics,
}

/// Resource usage of the agent process itself.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub cpu_percent: Option<f64>,
    pub mem_mb: Option<f64>,
}

/// The metrics a threshold can be configured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Cpu,
    Mem,
    Disk,
    Gpu,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Cpu,
        MetricKind::Mem,
        MetricKind::Disk,
        MetricKind::Gpu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Mem => "mem",
            MetricKind::Disk => "disk",
            MetricKind::Gpu => "gpu",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MetricSample {
    /// Value of a single metric, if the device reported it.
    pub fn metric(&self, kind: MetricKind) -> Option<f64> {
        match kind {
            MetricKind::Cpu => self.cpu_percent,
            MetricKind::Mem => self.mem_percent,
            MetricKind::Disk => self.disk_percent,
            MetricKind::Gpu => self.gpu_percent,
        }
    }
}

/// An edge-triggered threshold crossing, consumed once by the notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub device_id: String,
    pub metric: MetricKind,
    pub value: f64,
    pub threshold: f64,
    pub transitioned_at: DateTime<Utc>,
}

/// Topic filter the bridge subscribes with.
pub const METRICS_SUBSCRIPTION: &str = "devices/+/metrics";

/// Topic a device publishes its samples to.
pub fn metrics_topic(device_id: &str) -> String {
    format!("devices/{device_id}/metrics")
}

/// Extract the device id from a `devices/{device_id}/metrics` topic.
///
/// Returns `None` for anything that does not match the expected pattern.
pub fn parse_metrics_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("devices"), Some(id), Some("metrics"), None) if !id.is_empty() => Some(id),
        _ => None,
    }
}
