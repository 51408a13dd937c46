//! # Growbox - time-series core for a greenhouse monitor
//!
//! Storage and retrieval side of the growbox monitor: sensor samples, a
//! SQLite-backed reading store with retention pruning, min/max envelope
//! downsampling for chart history, and bounded live buffers.
//!
//! Acquisition (bus access, device drivers, polling loops) lives in
//! `growbox-gateway`; the HTTP dashboard in `growbox-dashboard`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use growbox::{sample, HistoryConfig, HistoryEngine, Sample, Store, StoreConfig};
//!
//! let store = Store::open(StoreConfig::with_path("sensors.db")).unwrap();
//!
//! let now = sample::now();
//! store.append(&Sample::climate("CH0-0x76", now, Some(24.1), Some(58.3))).unwrap();
//!
//! // Last value per sensor, falling back to older rows when nothing is new
//! let latest = store.latest_per_sensor(Some(now)).unwrap();
//! assert!(latest.contains_key("CH0-0x76"));
//!
//! // Chart series capped at 2 * 500 points per metric
//! let engine = HistoryEngine::new(HistoryConfig::default());
//! let rows = store.range_since(now - chrono::Duration::hours(24)).unwrap();
//! let history = engine.build(&rows);
//! ```
//!
//! ## Modules
//!
//! - [`sample`]: Sensor identities, readings and timestamps
//! - [`store`]: SQLite reading store
//! - [`history`]: Min/max downsampling
//! - [`live`]: Per-sensor live buffers
//! - [`config`]: Configuration types
//! - [`error`]: Error types

pub mod config;
pub mod error;
pub mod history;
pub mod live;
pub mod sample;
pub mod store;

pub use config::{
    HistoryConfig, LiveConfig, StoreConfig, DEFAULT_RETENTION, MAX_HISTORY_WINDOW, MAX_RETENTION,
};
pub use error::{ConfigError, Result, StorageError};
pub use history::{downsample_min_max, HistoryEngine, Metric, SensorHistory, SeriesPoint};
pub use live::{LiveBuffer, LiveCache, SharedLiveCache};
pub use sample::{
    ClimateReading, DeviceClass, PowerReading, Reading, ReadingRow, Sample, SensorId, Timestamp,
};
pub use store::Store;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
