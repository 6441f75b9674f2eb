//! Periodic host metric sampling.
//!
//! CPU, memory and disk come from `sysinfo`; GPU utilisation is read from
//! `nvidia-smi` when present. The sampler also reports the agent's own CPU and
//! memory footprint so operators can verify it stays lightweight.
//!
//! The sampling task runs on a fixed period independent of connection state
//! and only ever pushes into a channel, so it can never be stalled by the
//! network.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sysinfo::{Disks, Pid, System};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use crate::{AgentMetrics, MetricSample};

/// CPU level above which the agent logs a local warning.
const LOCAL_CPU_WARN: f64 = 90.0;

pub struct Sampler {
    sys: System,
    disks: Disks,
    own_pid: Option<Pid>,
    device_id: String,
}

impl Sampler {
    pub fn new(device_id: String) -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        // CPU usage needs two refreshes with a minimum gap to be meaningful
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_all();

        let own_pid = sysinfo::get_current_pid().ok();

        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
            own_pid,
            device_id,
        }
    }

    /// Take one sample of the host.
    pub async fn sample(&mut self) -> MetricSample {
        self.sys.refresh_all();
        self.disks.refresh(true);

        let cpus = self.sys.cpus();
        let cpu_percent = if cpus.is_empty() {
            None
        } else {
            let sum: f32 = cpus.iter().map(|cpu| cpu.cpu_usage()).sum();
            Some((sum as f64 / cpus.len() as f64).clamp(0.0, 100.0))
        };

        let mem_percent = match self.sys.total_memory() {
            0 => None,
            total => {
                Some((self.sys.used_memory() as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
            }
        };

        let disk_percent = self.root_disk_percent();
        let gpu_percent = gpu_percent().await;
        let agent_metrics = self.own_footprint();

        if let Some(cpu) = cpu_percent
            && cpu > LOCAL_CPU_WARN
        {
            warn!("CPU above {LOCAL_CPU_WARN:.0}% ({cpu:.1}%)");
        }

        debug!(
            agent_cpu = ?agent_metrics.cpu_percent,
            agent_mem_mb = ?agent_metrics.mem_mb,
            "agent self-monitoring"
        );

        MetricSample {
            device_id: self.device_id.clone(),
            timestamp: Utc::now(),
            cpu_percent,
            mem_percent,
            disk_percent,
            gpu_percent,
            agent_metrics,
        }
    }

    /// Usage of the root filesystem, or of the first disk if none is mounted
    /// at `/` (e.g. on Windows).
    fn root_disk_percent(&self) -> Option<f64> {
        let disks = self.disks.list();
        let disk = disks
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .or_else(|| disks.first())?;

        let total = disk.total_space();
        if total == 0 {
            return None;
        }
        let used = total.saturating_sub(disk.available_space());
        Some((used as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
    }

    fn own_footprint(&self) -> AgentMetrics {
        let Some(process) = self.own_pid.and_then(|pid| self.sys.process(pid)) else {
            return AgentMetrics::default();
        };

        AgentMetrics {
            cpu_percent: Some(process.cpu_usage() as f64),
            mem_mb: Some(process.memory() as f64 / (1024.0 * 1024.0)),
        }
    }
}

/// GPU utilisation via `nvidia-smi`, `None` if unavailable.
async fn gpu_percent() -> Option<f64> {
    let output = tokio::process::Command::new("nvidia-smi")
        .args(["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"])
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8(output.stdout).ok()?;
    let value: f64 = text.lines().next()?.trim().parse().ok()?;
    Some(value.clamp(0.0, 100.0))
}

/// Spawn the sampling task.
///
/// Samples are produced every `interval` and handed off over `tx`; the task
/// exits once the receiving side is gone.
#[instrument(skip(sampler, tx), fields(device_id = %sampler.device_id))]
pub fn spawn_sampler(
    mut sampler: Sampler,
    interval: Duration,
    tx: UnboundedSender<MetricSample>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("starting sampler with interval {interval:?}");
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;

            let sample = sampler.sample().await;
            trace!(cpu = ?sample.cpu_percent, mem = ?sample.mem_percent, "sampled host");

            if tx.send(sample).is_err() {
                debug!("publisher gone, stopping sampler");
                break;
            }
        }
    })
}
