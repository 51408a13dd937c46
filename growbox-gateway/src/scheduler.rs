// Growbox Gateway - Sensor acquisition layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Acquisition scheduler
//!
//! One [`Scheduler`] per device class. It scans its adapter's candidates
//! once, then reads every roster device on a fixed period, writing each
//! sample to the live cache and the store. A failing device is logged,
//! counted and skipped; it never ends the cycle or the loop.
//!
//! ```text
//!  Idle ──scan()──▶ Scanning ──roster fixed──▶ Running ──shutdown──▶ Stopped
//!                       │
//!                       └── no sensors, required ──▶ Stopped (error)
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use growbox::{DeviceClass, Sample, SensorId, SharedLiveCache, Store};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use crate::adapter::{DeviceAdapter, Roster};
use crate::config::SchedulerConfig;
use crate::error::{DeviceError, GatewayError, Result};

/// Lifecycle of one acquisition loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Scanning,
    Running,
    Stopped,
}

/// Outcome of one pass over the roster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Samples written to the store
    pub recorded: usize,
    /// Devices that failed or timed out
    pub read_failures: usize,
    /// Samples lost to a store error
    pub store_failures: usize,
    /// Samples without any usable metric
    pub rejected: usize,
}

/// Running totals shared with the metrics endpoint
#[derive(Debug, Default)]
pub struct AcquisitionStats {
    pub cycles: AtomicU64,
    pub recorded: AtomicU64,
    pub read_failures: AtomicU64,
    pub store_failures: AtomicU64,
    pub rejected: AtomicU64,
    pub roster_size: AtomicUsize,
}

/// Point-in-time copy of [`AcquisitionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub recorded: u64,
    pub read_failures: u64,
    pub store_failures: u64,
    pub rejected: u64,
    pub roster_size: usize,
}

impl AcquisitionStats {
    pub fn record(&self, report: &CycleReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.recorded
            .fetch_add(report.recorded as u64, Ordering::Relaxed);
        self.read_failures
            .fetch_add(report.read_failures as u64, Ordering::Relaxed);
        self.store_failures
            .fetch_add(report.store_failures as u64, Ordering::Relaxed);
        self.rejected
            .fetch_add(report.rejected as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            roster_size: self.roster_size.load(Ordering::Relaxed),
        }
    }
}

enum Persisted {
    Recorded,
    Rejected,
    Failed,
}

/// Periodic acquisition loop for one device class
pub struct Scheduler<A: DeviceAdapter> {
    adapter: A,
    config: SchedulerConfig,
    store: Arc<Store>,
    live: SharedLiveCache,
    stats: Arc<AcquisitionStats>,
    roster: Roster<A::Device>,
    state: SchedulerState,
}

impl<A: DeviceAdapter> Scheduler<A> {
    pub fn new(
        adapter: A,
        config: SchedulerConfig,
        store: Arc<Store>,
        live: SharedLiveCache,
    ) -> Self {
        Self {
            adapter,
            config,
            store,
            live,
            stats: Arc::new(AcquisitionStats::default()),
            roster: Roster::new(),
            state: SchedulerState::Idle,
        }
    }

    pub fn class(&self) -> DeviceClass {
        self.adapter.class()
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn roster(&self) -> &Roster<A::Device> {
        &self.roster
    }

    pub fn stats(&self) -> Arc<AcquisitionStats> {
        Arc::clone(&self.stats)
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Probe every candidate and fix the roster.
    ///
    /// Returns the number of devices found. Fails with
    /// [`GatewayError::NoSensors`] when sensors are required and none
    /// answered.
    pub async fn scan(&mut self) -> Result<usize> {
        self.state = SchedulerState::Scanning;
        let class = self.adapter.class();

        for device in self.adapter.candidates() {
            let sensor_id = self.adapter.sensor_id(&device);
            if let Err(e) = self.wait_ready(&sensor_id).await {
                log::debug!("Skipping {} during scan: {}", sensor_id, e);
                continue;
            }
            match time::timeout(self.config.read_timeout, self.adapter.probe(&device)).await {
                Ok(Ok(())) => {
                    self.roster.insert(sensor_id.clone(), device)?;
                    let registered = self
                        .live
                        .write()
                        .map(|mut live| live.register(&sensor_id))
                        .is_ok();
                    if !registered {
                        log::warn!("Live cache lock poisoned, {} not registered", sensor_id);
                    }
                }
                Ok(Err(e)) => log::debug!("No {} sensor at {}: {}", class, sensor_id, e),
                Err(_) => log::debug!("Probe of {} timed out", sensor_id),
            }
        }

        self.stats
            .roster_size
            .store(self.roster.len(), Ordering::Relaxed);

        if self.roster.is_empty() && self.config.require_sensors {
            self.state = SchedulerState::Stopped;
            return Err(GatewayError::NoSensors(class));
        }

        let names: Vec<String> = self.roster.ids().iter().map(|id| id.to_string()).collect();
        log::info!("Found {} {} sensors: {:?}", names.len(), class, names);
        self.state = SchedulerState::Running;
        Ok(self.roster.len())
    }

    /// Wait for the transport, at most one period, before a device's own
    /// timeout starts.
    async fn wait_ready(&self, sensor_id: &SensorId) -> std::result::Result<(), DeviceError> {
        time::timeout(self.config.period, self.adapter.ready())
            .await
            .map_err(|_| {
                log::debug!("Bus still busy before {} after {:?}", sensor_id, self.config.period);
                DeviceError::BusUnavailable(format!("busy for {:?}", self.config.period))
            })
    }

    async fn read_one(
        &self,
        sensor_id: &SensorId,
        device: &A::Device,
    ) -> std::result::Result<Sample, DeviceError> {
        self.wait_ready(sensor_id).await?;
        match time::timeout(self.config.read_timeout, self.adapter.read(device)).await {
            Ok(result) => result,
            Err(_) => {
                log::debug!("Read of {} exceeded {:?}", sensor_id, self.config.read_timeout);
                Err(DeviceError::Timeout(self.config.read_timeout))
            }
        }
    }

    async fn persist(&self, sample: Sample) -> Persisted {
        let store = Arc::clone(&self.store);
        let sensor_id = sample.sensor_id.clone();
        match tokio::task::spawn_blocking(move || store.append(&sample)).await {
            Ok(Ok(Some(_))) => Persisted::Recorded,
            Ok(Ok(None)) => Persisted::Rejected,
            Ok(Err(e)) => {
                log::error!("Failed to store sample from {}: {}", sensor_id, e);
                Persisted::Failed
            }
            Err(e) => {
                log::error!("Store worker for {} failed: {}", sensor_id, e);
                Persisted::Failed
            }
        }
    }

    /// Read every roster device once, in roster order
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        for entry in self.roster.iter() {
            let sample = match self.read_one(&entry.sensor_id, &entry.device).await {
                Ok(sample) => sample,
                Err(e) => {
                    log::warn!("Reading {} failed: {}", entry.sensor_id, e);
                    report.read_failures += 1;
                    continue;
                }
            };

            if !sample.reading.has_metric() {
                log::debug!("{} returned no usable value", entry.sensor_id);
                report.rejected += 1;
                continue;
            }

            let cached = self
                .live
                .write()
                .map(|mut live| live.push(sample.clone()))
                .is_ok();
            if !cached {
                log::warn!("Live cache lock poisoned, dropping live sample");
            }

            match self.persist(sample).await {
                Persisted::Recorded => report.recorded += 1,
                Persisted::Rejected => report.rejected += 1,
                Persisted::Failed => report.store_failures += 1,
            }
        }

        self.stats.record(&report);
        log::debug!("{} cycle: {:?}", self.adapter.class(), report);
        report
    }

    /// Scan if needed, then cycle every `period` until `shutdown` turns
    /// true or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.state == SchedulerState::Idle {
            self.scan().await?;
        }
        self.state = SchedulerState::Running;

        let mut ticker = time::interval(self.config.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!(
            "{} acquisition running every {:?}",
            self.adapter.class(),
            self.config.period
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.state = SchedulerState::Stopped;
        log::info!("{} acquisition stopped", self.adapter.class());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulate_reports() {
        let stats = AcquisitionStats::default();
        stats.record(&CycleReport {
            recorded: 2,
            read_failures: 1,
            store_failures: 0,
            rejected: 0,
        });
        stats.record(&CycleReport {
            recorded: 1,
            read_failures: 0,
            store_failures: 1,
            rejected: 1,
        });

        let snap = stats.snapshot();
        assert_eq!(snap.cycles, 2);
        assert_eq!(snap.recorded, 3);
        assert_eq!(snap.read_failures, 1);
        assert_eq!(snap.store_failures, 1);
        assert_eq!(snap.rejected, 1);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&SchedulerState::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
