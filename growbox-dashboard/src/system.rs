// Growbox Dashboard - Host statistics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! CPU load and SoC temperature of the host.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

/// Aggregate CPU jiffies from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

impl CpuTimes {
    pub fn parse(stat: &str) -> Option<Self> {
        let line = stat.lines().find(|l| l.starts_with("cpu "))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .take(8)
            .map(|f| f.parse().ok())
            .collect::<Option<_>>()?;
        if fields.len() < 4 {
            return None;
        }
        // idle + iowait
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        Some(Self {
            idle,
            total: fields.iter().sum(),
        })
    }

    /// Busy percentage between `earlier` and `self`, one decimal.
    pub fn usage_since(&self, earlier: &CpuTimes) -> Option<f64> {
        let total = self.total.checked_sub(earlier.total)?;
        let idle = self.idle.checked_sub(earlier.idle)?;
        if total == 0 {
            return None;
        }
        let busy = 100.0 * (1.0 - idle as f64 / total as f64);
        Some((busy * 10.0).round() / 10.0)
    }
}

/// Thermal zone reading in millidegrees to °C, one decimal.
pub fn parse_millidegrees(raw: &str) -> Option<f64> {
    let milli: i64 = raw.trim().parse().ok()?;
    Some((milli as f64 / 100.0).round() / 10.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SystemStats {
    pub cpu: Option<f64>,
    pub temp: Option<f64>,
}

/// Reads host statistics from procfs and sysfs.
#[derive(Debug, Clone)]
pub struct SystemMonitor {
    pub stat_path: PathBuf,
    pub thermal_path: PathBuf,
    pub interval: Duration,
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self {
            stat_path: PathBuf::from("/proc/stat"),
            thermal_path: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            interval: Duration::from_millis(500),
        }
    }
}

impl SystemMonitor {
    async fn cpu_times(&self) -> Option<CpuTimes> {
        match tokio::fs::read_to_string(&self.stat_path).await {
            Ok(stat) => CpuTimes::parse(&stat),
            Err(e) => {
                debug!("Cannot read {}: {}", self.stat_path.display(), e);
                None
            }
        }
    }

    async fn cpu_usage(&self) -> Option<f64> {
        let before = self.cpu_times().await?;
        tokio::time::sleep(self.interval).await;
        let after = self.cpu_times().await?;
        after.usage_since(&before)
    }

    async fn soc_temperature(&self) -> Option<f64> {
        match tokio::fs::read_to_string(&self.thermal_path).await {
            Ok(raw) => parse_millidegrees(&raw),
            Err(e) => {
                debug!("Cannot read {}: {}", self.thermal_path.display(), e);
                None
            }
        }
    }

    /// Sample both values; each is `None` when its source is unavailable.
    pub async fn sample(&self) -> SystemStats {
        let (cpu, temp) = tokio::join!(self.cpu_usage(), self.soc_temperature());
        SystemStats { cpu, temp }
    }
}
