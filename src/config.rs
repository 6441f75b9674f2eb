use std::net::SocketAddr;

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::trace;

use crate::MetricKind;

/// Broker connection settings shared by agent and bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_broker_port() -> u16 {
    1883
}

impl BrokerConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            bail!("broker.host must not be empty");
        }
        if self.username.is_some() != self.password.is_some() {
            bail!("broker credentials require both username and password");
        }
        Ok(())
    }
}

/// Configuration for the edge agent binary.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Device identity; also used as the MQTT client id.
    pub device_id: String,

    pub broker: BrokerConfig,

    /// Sampling period in seconds.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Maximum number of samples buffered while offline.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum unacknowledged publishes in flight at once.
    #[serde(default = "default_publish_window")]
    pub publish_window: usize,

    /// Timeout for a single broker connect attempt.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_interval_secs() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_publish_window() -> usize {
    16
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl AgentConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.device_id.is_empty() {
            bail!("device_id must not be empty");
        }
        if self.device_id.contains('/') || self.device_id.contains(['+', '#']) {
            bail!("device_id must not contain MQTT topic separators or wildcards");
        }
        self.broker.validate()?;
        if self.interval_secs == 0 {
            bail!("interval_secs must be positive");
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be positive");
        }
        if self.publish_window == 0 {
            bail!("publish_window must be positive");
        }
        Ok(())
    }
}

/// A single per-metric alert threshold.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Threshold {
    /// Alert when the metric is strictly above this value.
    pub limit: f64,

    /// Minimum seconds between fired alerts for the same device and metric.
    /// Zero means pure edge triggering.
    #[serde(default)]
    pub cooldown_secs: u64,
}

/// Per-metric thresholds; metrics without an entry are never evaluated.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Thresholds {
    pub cpu: Option<Threshold>,
    pub mem: Option<Threshold>,
    pub disk: Option<Threshold>,
    pub gpu: Option<Threshold>,
}

impl Thresholds {
    pub fn get(&self, kind: MetricKind) -> Option<Threshold> {
        match kind {
            MetricKind::Cpu => self.cpu,
            MetricKind::Mem => self.mem,
            MetricKind::Disk => self.disk,
            MetricKind::Gpu => self.gpu,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        for kind in MetricKind::ALL {
            if let Some(threshold) = self.get(kind) {
                if !threshold.limit.is_finite() || threshold.limit < 0.0 {
                    bail!("threshold for {kind} must be a non-negative number");
                }
            }
        }
        Ok(())
    }
}

/// Configuration for the bridge binary.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub broker: BrokerConfig,

    /// WebSocket listen address for dashboard clients.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Devices silent for longer than this many seconds are pruned.
    #[serde(default = "default_prune_window_secs")]
    pub prune_window_secs: u64,

    #[serde(default)]
    pub thresholds: Thresholds,

    /// Outbound webhook for alert delivery. Alerts are logged only if unset.
    pub webhook_url: Option<String>,
}

fn default_bind_addr() -> SocketAddr {
    "127.0.0.1:6789".parse().expect("valid default bind addr")
}

fn default_prune_window_secs() -> u64 {
    30
}

impl BridgeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.broker.validate()?;
        if self.prune_window_secs == 0 {
            bail!("prune_window_secs must be positive");
        }
        self.thresholds.validate()?;
        if let Some(url) = &self.webhook_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("webhook_url must be an http(s) URL");
            }
        }
        Ok(())
    }
}

pub fn read_agent_config(path: &str) -> anyhow::Result<AgentConfig> {
    let config: AgentConfig = read_json(path)?;
    config.validate()?;
    trace!("loaded agent config: {config:?}");
    Ok(config)
}

pub fn read_bridge_config(path: &str) -> anyhow::Result<BridgeConfig> {
    let config: BridgeConfig = read_json(path)?;
    config.validate()?;
    trace!("loaded bridge config: {config:?}");
    Ok(config)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {path}"))?;
    serde_json::from_str(&file_content)
        .with_context(|| format!("invalid configuration file {path}"))
}
