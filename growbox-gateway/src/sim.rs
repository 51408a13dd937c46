// Growbox Gateway - Sensor acquisition layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Simulated I2C bus
//!
//! An in-process stand-in for a TCA9548A multiplexer with BME280/BMP280
//! chips behind it, used for `--simulate` runs and tests. Devices emulate
//! the registers the driver touches: chip id, calibration blocks, control
//! registers and the data burst, which is only refreshed by a forced-mode
//! conversion. Faults can be injected per device at any time through any
//! clone of the bus.
//!
//! ```rust
//! use embedded_hal::i2c::I2c;
//! use growbox_gateway::sim::{SimDevice, SimulatedBus};
//!
//! let mut bus = SimulatedBus::new(Some(0x70))
//!     .with_device(1, 0x76, SimDevice::bme280(23.5, 61.0));
//!
//! // Not visible until channel 1 is selected
//! let mut id = [0u8; 1];
//! assert!(bus.write_read(0x76, &[0xD0], &mut id).is_err());
//!
//! bus.write(0x70, &[1 << 1]).unwrap();
//! bus.write_read(0x76, &[0xD0], &mut id).unwrap();
//! assert_eq!(id[0], 0x60);
//! ```

use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use embedded_hal::i2c::{self, ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};

use crate::bme280::{
    Calibration, ChipModel, CALIB_00_LEN, CALIB_26_LEN, CHIP_ID_BME280, CHIP_ID_BMP280, DATA_LEN,
    REG_CALIB_00, REG_CALIB_26, REG_CHIP_ID, REG_CTRL_HUM, REG_CTRL_MEAS, REG_DATA, REG_STATUS,
    SKIPPED_HUMIDITY, SKIPPED_TEMPERATURE,
};

/// Trimming values of a typical production chip
pub const REFERENCE_CALIBRATION: Calibration = Calibration {
    model: ChipModel::Bme280,
    t1: 27504,
    t2: 26435,
    t3: -1000,
    h1: 75,
    h2: 362,
    h3: 0,
    h4: 313,
    h5: 50,
    h6: 30,
};

/// Data registers after reset: every ADC word reads as skipped
const RESET_DATA: [u8; DATA_LEN] = [0x80, 0x00, 0x00, 0x80, 0x00, 0x00, 0x80, 0x00];

/// Injected device misbehaviour
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fault {
    /// Never acknowledges its address
    Absent,
    /// Reports another chip id
    ChipId(u8),
    /// Conversions leave the data registers at their reset values
    SkipMeasurement,
    /// Acknowledges, then fails every transfer
    BusError,
    /// Holds the bus for the given time before answering
    Stall(Duration),
}

/// Slow sinusoidal wander applied per conversion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drift {
    pub temperature: f64,
    pub humidity: f64,
    /// Conversions per full period
    pub period: u32,
}

/// One emulated BME280 or BMP280
#[derive(Debug, Clone)]
pub struct SimDevice {
    chip_id: u8,
    calibration: Calibration,
    temperature: f64,
    humidity: f64,
    drift: Option<Drift>,
    fault: Option<Fault>,
    pointer: u8,
    ctrl_hum: u8,
    ctrl_meas: u8,
    data: [u8; DATA_LEN],
    block0: [u8; CALIB_00_LEN],
    block1: [u8; CALIB_26_LEN],
    conversions: u64,
    calibration_reads: usize,
}

impl SimDevice {
    fn with_model(chip_id: u8, model: ChipModel, temperature: f64, humidity: f64) -> Self {
        let calibration = Calibration {
            model,
            ..REFERENCE_CALIBRATION
        };
        let (block0, block1) = encode_calibration(&calibration);
        Self {
            chip_id,
            calibration,
            temperature,
            humidity,
            drift: None,
            fault: None,
            pointer: 0,
            ctrl_hum: 0,
            ctrl_meas: 0,
            data: RESET_DATA,
            block0,
            block1,
            conversions: 0,
            calibration_reads: 0,
        }
    }

    /// Temperature and humidity sensor reading the given climate
    pub fn bme280(temperature: f64, humidity: f64) -> Self {
        Self::with_model(CHIP_ID_BME280, ChipModel::Bme280, temperature, humidity)
    }

    /// Temperature-only sibling chip
    pub fn bmp280(temperature: f64) -> Self {
        Self::with_model(CHIP_ID_BMP280, ChipModel::Bmp280, temperature, 0.0)
    }

    pub fn with_drift(mut self, drift: Drift) -> Self {
        self.drift = Some(drift);
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    fn current_climate(&self) -> (f64, f64) {
        match self.drift {
            Some(d) if d.period > 0 => {
                let phase = TAU * (self.conversions % d.period as u64) as f64 / d.period as f64;
                (
                    self.temperature + d.temperature * phase.sin(),
                    (self.humidity + d.humidity * phase.cos()).clamp(0.0, 100.0),
                )
            }
            _ => (self.temperature, self.humidity),
        }
    }

    fn convert(&mut self) {
        self.conversions += 1;
        if self.fault == Some(Fault::SkipMeasurement) {
            self.data = RESET_DATA;
            return;
        }

        let (temperature, humidity) = self.current_climate();
        // Out-of-range climate reads like a skipped conversion
        let Some(adc_t) = adc_for_temperature(&self.calibration, temperature) else {
            self.data = RESET_DATA;
            return;
        };
        let (_, t_fine) = self.calibration.compensate_temperature(adc_t);
        let adc_h = if self.calibration.model.has_humidity() && self.ctrl_hum & 0x07 != 0 {
            adc_for_humidity(&self.calibration, humidity, t_fine).unwrap_or(SKIPPED_HUMIDITY)
        } else {
            SKIPPED_HUMIDITY
        };

        self.data = [
            0x80,
            0x00,
            0x00,
            (adc_t >> 12) as u8,
            (adc_t >> 4) as u8,
            ((adc_t & 0x0F) << 4) as u8,
            (adc_h >> 8) as u8,
            adc_h as u8,
        ];
    }

    fn read_register(&self, register: u8) -> u8 {
        match register {
            REG_CHIP_ID => match self.fault {
                Some(Fault::ChipId(id)) => id,
                _ => self.chip_id,
            },
            r if (REG_CALIB_00..REG_CALIB_00 + CALIB_00_LEN as u8).contains(&r) => {
                self.block0[(r - REG_CALIB_00) as usize]
            }
            r if (REG_CALIB_26..REG_CALIB_26 + CALIB_26_LEN as u8).contains(&r) => {
                self.block1[(r - REG_CALIB_26) as usize]
            }
            REG_CTRL_HUM => self.ctrl_hum,
            REG_STATUS => 0,
            REG_CTRL_MEAS => self.ctrl_meas,
            r if r >= REG_DATA && ((r - REG_DATA) as usize) < DATA_LEN => {
                self.data[(r - REG_DATA) as usize]
            }
            _ => 0,
        }
    }

    fn write_register(&mut self, register: u8, value: u8) {
        match register {
            REG_CTRL_HUM => self.ctrl_hum = value,
            REG_CTRL_MEAS => {
                self.ctrl_meas = value;
                // Mode bits 01 and 10 both start a forced conversion
                if matches!(value & 0x03, 0x01 | 0x02) {
                    self.convert();
                }
            }
            _ => {}
        }
    }

    fn transaction(&mut self, operations: &mut [Operation<'_>]) -> Result<(), SimError> {
        if self.fault == Some(Fault::BusError) {
            return Err(SimError(ErrorKind::Other));
        }
        for op in operations {
            match op {
                Operation::Write(bytes) => {
                    if let Some((register, values)) = bytes.split_first() {
                        self.pointer = *register;
                        for (i, value) in values.iter().enumerate() {
                            self.write_register(register.wrapping_add(i as u8), *value);
                        }
                    }
                }
                Operation::Read(buf) => {
                    if self.pointer == REG_CALIB_00 {
                        self.calibration_reads += 1;
                    }
                    for (i, byte) in buf.iter_mut().enumerate() {
                        *byte = self.read_register(self.pointer.wrapping_add(i as u8));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Encode a calibration into its two register blocks
pub fn encode_calibration(cal: &Calibration) -> ([u8; CALIB_00_LEN], [u8; CALIB_26_LEN]) {
    let mut block0 = [0u8; CALIB_00_LEN];
    block0[0..2].copy_from_slice(&cal.t1.to_le_bytes());
    block0[2..4].copy_from_slice(&cal.t2.to_le_bytes());
    block0[4..6].copy_from_slice(&cal.t3.to_le_bytes());
    block0[25] = cal.h1;

    let h2 = cal.h2.to_le_bytes();
    let block1 = [
        h2[0],
        h2[1],
        cal.h3,
        (cal.h4 >> 4) as u8,
        (((cal.h5 & 0x0F) << 4) | (cal.h4 & 0x0F)) as u8,
        (cal.h5 >> 4) as u8,
        cal.h6 as u8,
    ];
    (block0, block1)
}

/// Full scale of the 20-bit temperature word
pub const ADC_T_MAX: u32 = (1 << 20) - 1;
/// Full scale of the 16-bit humidity word
pub const ADC_H_MAX: u32 = (1 << 16) - 1;

/// ADC word in `0..=max` whose value is closest to `target`, never `marker`.
///
/// `value` must be non-decreasing. `None` when `target` lies outside the
/// range the word can express.
fn invert(max: u32, marker: u32, target: f64, value: impl Fn(u32) -> f64) -> Option<u32> {
    if !(value(0)..=value(max)).contains(&target) {
        return None;
    }

    let (mut lo, mut hi) = (0u32, max);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if value(mid) < target {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo > 0 && target - value(lo - 1) <= value(lo) - target {
        lo -= 1;
    }

    if lo != marker {
        Some(lo)
    } else if lo < max {
        Some(lo + 1)
    } else {
        Some(lo - 1)
    }
}

/// Raw temperature word that compensates to `celsius`
pub fn adc_for_temperature(cal: &Calibration, celsius: f64) -> Option<u32> {
    invert(ADC_T_MAX, SKIPPED_TEMPERATURE, celsius, |adc| {
        cal.compensate_temperature(adc).0
    })
}

/// Raw humidity word that compensates to `percent` at `t_fine`
pub fn adc_for_humidity(cal: &Calibration, percent: f64, t_fine: f64) -> Option<u32> {
    invert(ADC_H_MAX, SKIPPED_HUMIDITY, percent, |adc| {
        cal.compensate_humidity(adc, t_fine)
    })
}

/// Error raised by the simulated bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimError(pub ErrorKind);

impl i2c::Error for SimError {
    fn kind(&self) -> ErrorKind {
        self.0
    }
}

#[derive(Debug)]
struct SimState {
    mux_address: Option<u8>,
    selected: u8,
    mux_writes: usize,
    devices: BTreeMap<(u8, u8), SimDevice>,
}

impl SimState {
    /// Channel of the single device answering `address` on the current route
    fn route(&self, address: u8) -> Result<u8, SimError> {
        let visible: Vec<u8> = self
            .devices
            .iter()
            .filter(|((channel, addr), device)| {
                *addr == address
                    && device.fault != Some(Fault::Absent)
                    && match self.mux_address {
                        Some(_) => self.selected & (1u8 << channel) != 0,
                        None => true,
                    }
            })
            .map(|((channel, _), _)| *channel)
            .collect();

        match visible.as_slice() {
            [] => Err(SimError(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address))),
            [channel] => Ok(*channel),
            _ => Err(SimError(ErrorKind::Bus)),
        }
    }
}

/// Cloneable handle to one emulated bus
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    pub fn new(mux_address: Option<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                mux_address,
                selected: 0,
                mux_writes: 0,
                devices: BTreeMap::new(),
            })),
        }
    }

    /// Two drifting sensors on channels 0 and 1 behind a mux at 0x70
    pub fn greenhouse() -> Self {
        Self::new(Some(0x70))
            .with_device(
                0,
                0x76,
                SimDevice::bme280(24.0, 60.0).with_drift(Drift {
                    temperature: 2.5,
                    humidity: 8.0,
                    period: 1440,
                }),
            )
            .with_device(
                1,
                0x77,
                SimDevice::bme280(21.5, 68.0).with_drift(Drift {
                    temperature: 1.5,
                    humidity: 5.0,
                    period: 720,
                }),
            )
    }

    /// Attach a device; on a bus without mux use channel 0
    pub fn with_device(self, channel: u8, address: u8, device: SimDevice) -> Self {
        self.lock().devices.insert((channel, address), device);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // Register state stays consistent across a poisoned lock
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_sim_device<T>(
        &self,
        channel: u8,
        address: u8,
        f: impl FnOnce(&mut SimDevice) -> T,
    ) -> Option<T> {
        self.lock().devices.get_mut(&(channel, address)).map(f)
    }

    pub fn set_fault(&self, channel: u8, address: u8, fault: Option<Fault>) {
        self.with_sim_device(channel, address, |d| d.fault = fault);
    }

    pub fn set_climate(&self, channel: u8, address: u8, temperature: f64, humidity: f64) {
        self.with_sim_device(channel, address, |d| {
            d.temperature = temperature;
            d.humidity = humidity;
        });
    }

    pub fn calibration_reads(&self, channel: u8, address: u8) -> usize {
        self.with_sim_device(channel, address, |d| d.calibration_reads)
            .unwrap_or(0)
    }

    pub fn conversions(&self, channel: u8, address: u8) -> u64 {
        self.with_sim_device(channel, address, |d| d.conversions)
            .unwrap_or(0)
    }

    pub fn selected_mask(&self) -> u8 {
        self.lock().selected
    }

    pub fn mux_writes(&self) -> usize {
        self.lock().mux_writes
    }
}

impl ErrorType for SimulatedBus {
    type Error = SimError;
}

impl I2c for SimulatedBus {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let stall = {
            let mut state = self.lock();
            if state.mux_address == Some(address) {
                for op in operations.iter_mut() {
                    match op {
                        Operation::Write(bytes) => {
                            if let Some(mask) = bytes.last() {
                                state.selected = *mask;
                                state.mux_writes += 1;
                            }
                        }
                        Operation::Read(buf) => buf.fill(state.selected),
                    }
                }
                return Ok(());
            }

            let channel = state.route(address)?;
            match state.devices.get(&(channel, address)).and_then(|d| d.fault) {
                Some(Fault::Stall(duration)) => Some((channel, duration)),
                _ => None,
            }
        };

        // Stall outside the state lock so fault injection stays possible
        let key = match stall {
            Some((channel, duration)) => {
                thread::sleep(duration);
                (channel, address)
            }
            None => (self.lock().route(address)?, address),
        };

        let mut state = self.lock();
        match state.devices.get_mut(&key) {
            Some(device) => device.transaction(operations),
            None => Err(SimError(ErrorKind::NoAcknowledge(
                NoAcknowledgeSource::Address,
            ))),
        }
    }
}
