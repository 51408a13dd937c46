// Growbox Gateway - Sensor acquisition layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Growbox Gateway - Sensor acquisition layer
//!
//! Reads climate sensors behind an I2C multiplexer and Shelly power meters
//! on a fixed period, and feeds the samples into the growbox store and live
//! cache.
//!
//! ## Features
//!
//! - **Multiplexed bus**: channel select and transfer under one lock, with a
//!   per-device calibration cache
//! - **BME280 / BMP280 driver**: forced-mode conversions on any
//!   `embedded-hal` 1.0 bus
//! - **Shelly Gen2 power meters** over the local RPC endpoint
//! - **Fault isolation**: a dead sensor is skipped, never fatal
//! - **Simulated bus** for development without hardware
//! - **Linux `/dev/i2c-*` access** behind the `hardware` feature
//!
//! ## Quick Start
//!
//! ```rust
//! use growbox::{LiveCache, LiveConfig, Store, StoreConfig};
//! use growbox_gateway::sim::SimulatedBus;
//! use growbox_gateway::{Bme280Adapter, BusConfig, MuxedBus, Scheduler, SchedulerConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! # let dir = tempfile::tempdir().unwrap();
//! let store = Arc::new(Store::open(StoreConfig::with_path(dir.path().join("db"))).unwrap());
//! let live = LiveCache::shared(&LiveConfig::default());
//!
//! // Two BME280s on channels 0 and 1 of a mux at 0x70
//! let config = BusConfig::default();
//! let bus = MuxedBus::from_config(SimulatedBus::greenhouse(), &config).into_shared();
//! let adapter = Bme280Adapter::new(bus, &config);
//!
//! let mut scheduler = Scheduler::new(adapter, SchedulerConfig::climate(), store, live);
//! assert_eq!(scheduler.scan().await.unwrap(), 2);
//!
//! let report = scheduler.run_cycle().await;
//! assert_eq!(report.recorded, 2);
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  Growbox Gateway                                           │
//! │                                                            │
//! │  ┌───────────────────────┐      ┌──────────────────────┐   │
//! │  │ Scheduler (climate)   │      │ Scheduler (power)    │   │
//! │  │   Bme280Adapter       │      │   ShellyAdapter      │   │
//! │  │     MuxedBus          │      │     reqwest          │   │
//! │  │   [ch0 0x76][ch1 0x77]│      │   [switch 0]         │   │
//! │  └──────────┬────────────┘      └──────────┬───────────┘   │
//! │             └──────────────┬───────────────┘               │
//! │                            ▼                               │
//! │               Store (SQLite) + LiveCache                   │
//! └────────────────────────────────────────────────────────────┘
//! ```

mod adapter;
mod bus;
mod config;
mod error;
mod power_meter;
mod scheduler;

pub mod bme280;
pub mod sim;

// Public API
pub use adapter::{DeviceAdapter, Roster, RosterEntry};
pub use bme280::{Bme280Adapter, Calibration, ChipModel};
pub use bus::{transact, BusDevice, MuxedBus, SharedBus};
pub use config::{
    BusConfig, PowerMeterConfig, SchedulerConfig, BME280_ADDRESSES, DEFAULT_MUX_ADDRESS,
};
pub use error::{DeviceError, GatewayError, Result};
pub use power_meter::{ShellyAdapter, SwitchStatus};
pub use scheduler::{AcquisitionStats, CycleReport, Scheduler, SchedulerState, StatsSnapshot};

#[cfg(feature = "hardware")]
pub use bus::open_linux;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
