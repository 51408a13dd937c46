// Growbox Gateway - Sensor acquisition layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Multiplexed I2C bus
//!
//! [`MuxedBus`] owns the bus handle, the multiplexer selection and the
//! per-device calibration cache. It is shared as [`SharedBus`]; one lock
//! guard covers a channel select and the device transaction that follows,
//! so two devices at the same address on different channels never see each
//! other's traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use embedded_hal::i2c::I2c;
use tokio::sync::Mutex;

use crate::bme280::Calibration;
use crate::config::BusConfig;
use crate::error::DeviceError;

/// Position of a device: multiplexer channel and bus address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusDevice {
    pub channel: u8,
    pub address: u8,
}

/// Bus handle with multiplexer selection and calibration cache
pub struct MuxedBus<I> {
    i2c: I,
    mux_address: Option<u8>,
    settle_delay: Duration,
    calibration: HashMap<BusDevice, Calibration>,
}

/// Bus shared between blocking workers.
///
/// An async mutex, so callers can queue for the bus without holding a
/// worker thread.
pub type SharedBus<I> = Arc<Mutex<MuxedBus<I>>>;

impl<I: I2c> MuxedBus<I> {
    pub fn new(i2c: I, mux_address: Option<u8>, settle_delay: Duration) -> Self {
        Self {
            i2c,
            mux_address,
            settle_delay,
            calibration: HashMap::new(),
        }
    }

    pub fn from_config(i2c: I, config: &BusConfig) -> Self {
        Self::new(i2c, config.mux_address, config.settle_delay)
    }

    pub fn into_shared(self) -> SharedBus<I> {
        Arc::new(Mutex::new(self))
    }

    /// Route the bus to `channel`. No-op without a multiplexer.
    pub fn select(&mut self, channel: u8) -> Result<(), DeviceError> {
        let Some(mux) = self.mux_address else {
            return Ok(());
        };
        if channel > 7 {
            return Err(DeviceError::BusUnavailable(format!(
                "mux channel {} out of range",
                channel
            )));
        }
        self.i2c
            .write(mux, &[1u8 << channel])
            .map_err(|e| DeviceError::from_i2c(&e))?;
        if !self.settle_delay.is_zero() {
            thread::sleep(self.settle_delay);
        }
        Ok(())
    }

    /// Calibration for the device, read from the chip on first use.
    ///
    /// The channel must already be selected.
    pub fn calibration(&mut self, channel: u8, address: u8) -> Result<Calibration, DeviceError> {
        let key = BusDevice { channel, address };
        if let Some(cal) = self.calibration.get(&key) {
            return Ok(*cal);
        }
        let cal = Calibration::read(&mut self.i2c, address)?;
        log::debug!(
            "Loaded {:?} calibration for channel {} address 0x{:02x}",
            cal.model,
            channel,
            address
        );
        self.calibration.insert(key, cal);
        Ok(cal)
    }

    pub fn cached_calibrations(&self) -> usize {
        self.calibration.len()
    }

    pub fn i2c_mut(&mut self) -> &mut I {
        &mut self.i2c
    }
}

/// Run `f` with the bus locked, on the blocking thread pool.
///
/// The guard moves into the worker, so the bus stays held until `f`
/// returns even when the caller has stopped waiting for it.
pub async fn transact<I, T, F>(bus: &SharedBus<I>, f: F) -> Result<T, DeviceError>
where
    I: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut MuxedBus<I>) -> Result<T, DeviceError> + Send + 'static,
{
    let mut guard = Arc::clone(bus).lock_owned().await;
    tokio::task::spawn_blocking(move || f(&mut *guard))
        .await
        .map_err(|e| DeviceError::BusUnavailable(e.to_string()))?
}

/// Resolve once no transaction holds the bus
pub async fn idle<I>(bus: &SharedBus<I>) {
    drop(bus.lock().await);
}

/// Open the Linux bus device named in `config`
#[cfg(feature = "hardware")]
pub fn open_linux(
    config: &BusConfig,
) -> crate::error::Result<MuxedBus<linux_embedded_hal::I2cdev>> {
    let i2c = linux_embedded_hal::I2cdev::new(&config.device).map_err(|e| {
        crate::error::GatewayError::BusOpen {
            path: config.device.display().to_string(),
            reason: e.to_string(),
        }
    })?;
    log::info!("Opened I2C bus {}", config.device.display());
    Ok(MuxedBus::from_config(i2c, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimulatedBus};

    fn bus() -> (SimulatedBus, MuxedBus<SimulatedBus>) {
        let sim = SimulatedBus::new(Some(0x70))
            .with_device(0, 0x76, SimDevice::bme280(21.0, 50.0))
            .with_device(1, 0x76, SimDevice::bme280(24.0, 60.0));
        let muxed = MuxedBus::new(sim.clone(), Some(0x70), Duration::ZERO);
        (sim, muxed)
    }

    #[test]
    fn test_select_writes_channel_mask() {
        let (sim, mut bus) = bus();
        bus.select(1).unwrap();
        assert_eq!(sim.selected_mask(), 0b10);
        bus.select(0).unwrap();
        assert_eq!(sim.selected_mask(), 0b01);
        assert_eq!(sim.mux_writes(), 2);
    }

    #[test]
    fn test_select_without_mux_is_noop() {
        let sim = SimulatedBus::new(None).with_device(0, 0x76, SimDevice::bme280(21.0, 50.0));
        let mut bus = MuxedBus::new(sim.clone(), None, Duration::ZERO);
        bus.select(5).unwrap();
        assert_eq!(sim.mux_writes(), 0);
    }

    #[test]
    fn test_select_rejects_out_of_range_channel() {
        let (_, mut bus) = bus();
        assert!(bus.select(8).is_err());
    }

    #[test]
    fn test_calibration_cached_per_device() {
        let (sim, mut bus) = bus();

        bus.select(0).unwrap();
        bus.calibration(0, 0x76).unwrap();
        bus.calibration(0, 0x76).unwrap();
        bus.select(1).unwrap();
        bus.calibration(1, 0x76).unwrap();

        assert_eq!(bus.cached_calibrations(), 2);
        assert_eq!(sim.calibration_reads(0, 0x76), 1);
        assert_eq!(sim.calibration_reads(1, 0x76), 1);
    }

    #[test]
    fn test_failed_calibration_not_cached() {
        let (sim, mut bus) = bus();
        bus.select(0).unwrap();
        sim.set_fault(0, 0x76, Some(crate::sim::Fault::Absent));
        assert!(bus.calibration(0, 0x76).is_err());
        assert_eq!(bus.cached_calibrations(), 0);

        sim.set_fault(0, 0x76, None);
        bus.calibration(0, 0x76).unwrap();
        assert_eq!(bus.cached_calibrations(), 1);
    }

    #[tokio::test]
    async fn test_transact_runs_under_lock() {
        let (_, bus) = bus();
        let shared = bus.into_shared();
        let model = transact(&shared, |bus| {
            bus.select(1)?;
            crate::bme280::identify(bus.i2c_mut(), 0x76)
        })
        .await
        .unwrap();
        assert_eq!(model, crate::bme280::ChipModel::Bme280);
    }

    #[tokio::test]
    async fn test_abandoned_transaction_keeps_bus_until_done() {
        let (_, bus) = bus();
        let shared = bus.into_shared();

        let slow = transact(&shared, |_| {
            thread::sleep(Duration::from_millis(200));
            Ok(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(20), slow)
            .await
            .is_err());

        // The worker still owns the guard
        assert!(shared.try_lock().is_err());
        tokio::time::timeout(Duration::from_secs(2), idle(&shared))
            .await
            .unwrap();
        assert!(shared.try_lock().is_ok());
    }
}
