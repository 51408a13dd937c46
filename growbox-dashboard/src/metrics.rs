// Growbox Dashboard - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for the growbox daemon.
//!
//! Acquisition gauges mirror the schedulers' running totals and are
//! refreshed at scrape time; the relay restart counter is bumped by the
//! relay task itself.

use growbox::DeviceClass;
use growbox_gateway::StatsSnapshot;
use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_gauge_vec, register_int_counter, Encoder, Gauge, GaugeVec,
    IntCounter, TextEncoder,
};

lazy_static! {
    // ============================================================
    // Acquisition (per device class)
    // ============================================================

    /// Completed acquisition cycles.
    pub static ref CYCLES_TOTAL: GaugeVec = register_gauge_vec!(
        "growbox_cycles_total",
        "Completed acquisition cycles",
        &["class"]
    ).unwrap();

    /// Samples written to the store.
    pub static ref SAMPLES_RECORDED_TOTAL: GaugeVec = register_gauge_vec!(
        "growbox_samples_recorded_total",
        "Samples written to the store",
        &["class"]
    ).unwrap();

    /// Device reads that failed or timed out.
    pub static ref READ_FAILURES_TOTAL: GaugeVec = register_gauge_vec!(
        "growbox_read_failures_total",
        "Device reads that failed or timed out",
        &["class"]
    ).unwrap();

    /// Samples lost to a store error.
    pub static ref STORE_FAILURES_TOTAL: GaugeVec = register_gauge_vec!(
        "growbox_store_failures_total",
        "Samples lost to a store error",
        &["class"]
    ).unwrap();

    /// Samples without any usable metric.
    pub static ref SAMPLES_REJECTED_TOTAL: GaugeVec = register_gauge_vec!(
        "growbox_samples_rejected_total",
        "Samples without any usable metric",
        &["class"]
    ).unwrap();

    /// Devices found by the startup scan.
    pub static ref ROSTER_SIZE: GaugeVec = register_gauge_vec!(
        "growbox_roster_size",
        "Devices found by the startup scan",
        &["class"]
    ).unwrap();

    // ============================================================
    // Storage
    // ============================================================

    /// Rows currently held by the store.
    pub static ref STORE_ROWS: Gauge = register_gauge!(
        "growbox_store_rows",
        "Rows currently held by the store"
    ).unwrap();

    /// Samples held by the live buffers.
    pub static ref LIVE_SAMPLES: Gauge = register_gauge!(
        "growbox_live_samples",
        "Samples held by the live buffers"
    ).unwrap();

    // ============================================================
    // Video relay
    // ============================================================

    /// Relay restarts since startup.
    pub static ref RELAY_RESTARTS_TOTAL: IntCounter = register_int_counter!(
        "growbox_relay_restarts_total",
        "Video relay restarts since startup"
    ).unwrap();

    /// Whether the relay child process is running (1) or not (0).
    pub static ref RELAY_RUNNING: Gauge = register_gauge!(
        "growbox_relay_running",
        "Video relay child process running (1) or not (0)"
    ).unwrap();
}

/// Mirror one scheduler's totals.
pub fn update_acquisition_metrics(class: DeviceClass, stats: &StatsSnapshot) {
    let label = [class.as_str()];
    CYCLES_TOTAL.with_label_values(&label).set(stats.cycles as f64);
    SAMPLES_RECORDED_TOTAL
        .with_label_values(&label)
        .set(stats.recorded as f64);
    READ_FAILURES_TOTAL
        .with_label_values(&label)
        .set(stats.read_failures as f64);
    STORE_FAILURES_TOTAL
        .with_label_values(&label)
        .set(stats.store_failures as f64);
    SAMPLES_REJECTED_TOTAL
        .with_label_values(&label)
        .set(stats.rejected as f64);
    ROSTER_SIZE
        .with_label_values(&label)
        .set(stats.roster_size as f64);
}

pub fn update_storage_metrics(store_rows: u64, live_samples: usize) {
    STORE_ROWS.set(store_rows as f64);
    LIVE_SAMPLES.set(live_samples as f64);
}

pub fn record_relay_restart() {
    RELAY_RESTARTS_TOTAL.inc();
}

pub fn set_relay_running(running: bool) {
    RELAY_RUNNING.set(if running { 1.0 } else { 0.0 });
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquisition_metrics_labelled_by_class() {
        let stats = StatsSnapshot {
            cycles: 12,
            recorded: 22,
            read_failures: 2,
            store_failures: 0,
            rejected: 0,
            roster_size: 2,
        };
        update_acquisition_metrics(DeviceClass::Climate, &stats);

        assert_eq!(
            CYCLES_TOTAL
                .with_label_values(&[DeviceClass::Climate.as_str()])
                .get(),
            12.0
        );
        let output = encode_metrics().unwrap();
        assert!(output.contains("growbox_samples_recorded_total"));
        assert!(output.contains("growbox_roster_size"));
    }

    #[test]
    fn test_relay_metrics() {
        let before = RELAY_RESTARTS_TOTAL.get();
        record_relay_restart();
        assert!(RELAY_RESTARTS_TOTAL.get() > before);

        set_relay_running(true);
        assert_eq!(RELAY_RUNNING.get(), 1.0);
        set_relay_running(false);
        assert_eq!(RELAY_RUNNING.get(), 0.0);
    }
}
