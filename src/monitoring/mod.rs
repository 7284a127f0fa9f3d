//! Resource monitoring.
//!
//! A background job samples process resident set size and system-wide
//! memory/disk pressure into a bounded in-memory ring (about a day at
//! one-minute cadence) and emits a warning line to the service log when a
//! threshold is crossed. The trimmer runs on the same timer as the
//! sampler; an unscheduled trimmer is the documented memory-leak failure
//! mode, so starting the monitor IS scheduling it.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::constants::MONITOR_RING_CAPACITY;

/// System health status levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// One periodic sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub taken_at: DateTime<Utc>,
    pub process_rss_mb: f64,
    pub system_memory_percent: f64,
    pub disk_usage_percent: f64,
}

/// Warning/critical thresholds, in percent.
#[derive(Debug, Clone)]
pub struct MonitorThresholds {
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub disk_warning: f64,
    pub disk_critical: f64,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            memory_warning: 80.0,
            memory_critical: 95.0,
            disk_warning: 85.0,
            disk_critical: 95.0,
        }
    }
}

/// Point-in-time view for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub uptime_seconds: f64,
    pub health: HealthStatus,
    pub latest: Option<ResourceSample>,
    pub samples_held: usize,
}

pub struct ResourceMonitor {
    config: MonitorConfig,
    thresholds: MonitorThresholds,
    /// Disk pressure is measured where the state lives.
    data_dir: PathBuf,
    ring: Arc<RwLock<VecDeque<ResourceSample>>>,
    start_time: Instant,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, data_dir: PathBuf) -> Self {
        Self {
            config,
            thresholds: MonitorThresholds::default(),
            data_dir,
            ring: Arc::new(RwLock::new(VecDeque::with_capacity(MONITOR_RING_CAPACITY))),
            start_time: Instant::now(),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Start the sampling loop.
    pub async fn start(self: &Arc<Self>) {
        info!(
            "Resource monitor sampling every {}s",
            self.config.interval.as_secs()
        );
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => monitor.collect_once().await,
                    _ = monitor.shutdown.cancelled() => {
                        info!("Resource monitor shutting down");
                        break;
                    }
                }
            }
        });
        *self.handle.lock().await = Some(handle);
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub async fn snapshot(&self) -> MonitorSnapshot {
        let ring = self.ring.read().await;
        let latest = ring.back().cloned();
        MonitorSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs_f64(),
            health: latest
                .as_ref()
                .map(|s| self.health_of(s))
                .unwrap_or(HealthStatus::Healthy),
            latest,
            samples_held: ring.len(),
        }
    }

    /// Take one sample, append it, trim the ring, and warn on thresholds.
    pub async fn collect_once(&self) {
        let sample = ResourceSample {
            taken_at: Utc::now(),
            process_rss_mb: process_rss_mb(),
            system_memory_percent: system_memory_percent(),
            disk_usage_percent: disk_usage_percent(&self.data_dir).await,
        };

        match self.health_of(&sample) {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded => warn!(
                "Resource pressure: memory {:.1}%, disk {:.1}%, rss {:.1} MB",
                sample.system_memory_percent, sample.disk_usage_percent, sample.process_rss_mb
            ),
            HealthStatus::Critical => warn!(
                "CRITICAL resource pressure: memory {:.1}%, disk {:.1}%, rss {:.1} MB",
                sample.system_memory_percent, sample.disk_usage_percent, sample.process_rss_mb
            ),
        }

        let mut ring = self.ring.write().await;
        ring.push_back(sample);
        while ring.len() > MONITOR_RING_CAPACITY {
            ring.pop_front();
        }
    }

    fn health_of(&self, sample: &ResourceSample) -> HealthStatus {
        let t = &self.thresholds;
        if sample.system_memory_percent >= t.memory_critical
            || sample.disk_usage_percent >= t.disk_critical
        {
            HealthStatus::Critical
        } else if sample.system_memory_percent >= t.memory_warning
            || sample.disk_usage_percent >= t.disk_warning
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Resident set size of this process, in megabytes.
fn process_rss_mb() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest
                        .split_whitespace()
                        .next()
                        .and_then(|v| v.parse::<f64>().ok())
                    {
                        return kb / 1024.0;
                    }
                }
            }
        }
        0.0
    }
    #[cfg(not(target_os = "linux"))]
    {
        debug!("process RSS sampling not implemented on this platform");
        0.0
    }
}

/// System-wide memory usage percent.
fn system_memory_percent() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            let mut total = 0.0;
            let mut available = 0.0;
            for line in meminfo.lines() {
                let mut parts = line.split_whitespace();
                match parts.next() {
                    Some("MemTotal:") => {
                        total = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0.0)
                    }
                    Some("MemAvailable:") => {
                        available = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0.0)
                    }
                    _ => {}
                }
            }
            if total > 0.0 {
                return (total - available) / total * 100.0;
            }
        }
        0.0
    }
    #[cfg(not(target_os = "linux"))]
    {
        debug!("system memory sampling not implemented on this platform");
        0.0
    }
}

/// Usage percent of the filesystem holding the data directory, via
/// `df -P` so the same code serves every unix.
async fn disk_usage_percent(dir: &std::path::Path) -> f64 {
    let output = tokio::process::Command::new("df")
        .arg("-P")
        .arg(dir)
        .output()
        .await;
    if let Ok(output) = output {
        if output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout);
            if let Some(line) = text.lines().nth(1) {
                // Fifth column is "Capacity%" in POSIX df output.
                if let Some(percent) = line
                    .split_whitespace()
                    .nth(4)
                    .and_then(|v| v.trim_end_matches('%').parse::<f64>().ok())
                {
                    return percent;
                }
            }
        }
    }
    debug!("df probe failed for {}", dir.display());
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn monitor() -> Arc<ResourceMonitor> {
        Arc::new(ResourceMonitor::new(
            MonitorConfig {
                interval: Duration::from_secs(60),
            },
            std::env::temp_dir(),
        ))
    }

    #[tokio::test]
    async fn collects_and_holds_samples() {
        let monitor = monitor();
        monitor.collect_once().await;
        monitor.collect_once().await;

        let snapshot = monitor.snapshot().await;
        assert_eq!(snapshot.samples_held, 2);
        assert!(snapshot.latest.is_some());
    }

    #[tokio::test]
    async fn ring_is_bounded() {
        let monitor = monitor();
        {
            let mut ring = monitor.ring.write().await;
            for i in 0..(MONITOR_RING_CAPACITY + 25) {
                ring.push_back(ResourceSample {
                    taken_at: Utc::now(),
                    process_rss_mb: i as f64,
                    system_memory_percent: 10.0,
                    disk_usage_percent: 10.0,
                });
            }
        }
        // The next collection trims back to capacity.
        monitor.collect_once().await;
        assert!(monitor.snapshot().await.samples_held <= MONITOR_RING_CAPACITY);
    }

    #[tokio::test]
    async fn health_follows_thresholds() {
        let monitor = monitor();
        let healthy = ResourceSample {
            taken_at: Utc::now(),
            process_rss_mb: 50.0,
            system_memory_percent: 40.0,
            disk_usage_percent: 40.0,
        };
        let degraded = ResourceSample {
            system_memory_percent: 85.0,
            ..healthy.clone()
        };
        let critical = ResourceSample {
            disk_usage_percent: 97.0,
            ..healthy.clone()
        };
        assert_eq!(monitor.health_of(&healthy), HealthStatus::Healthy);
        assert_eq!(monitor.health_of(&degraded), HealthStatus::Degraded);
        assert_eq!(monitor.health_of(&critical), HealthStatus::Critical);
    }

    #[tokio::test]
    async fn start_and_shutdown_are_clean() {
        let monitor = monitor();
        monitor.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.shutdown().await;
        // The startup tick fires immediately, so at least one sample
        // should have landed.
        assert!(monitor.snapshot().await.samples_held >= 1);
    }
}
