// Growbox Gateway - Sensor acquisition layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! BME280 / BMP280 driver and climate adapter
//!
//! Register-level driver over any `embedded_hal::i2c::I2c` bus: chip
//! identification, calibration readout, forced-mode conversion and the
//! floating-point compensation formulas from the Bosch datasheet. A BMP280
//! answers the same register map without the humidity block, so its
//! readings carry temperature only.

use std::future::Future;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use embedded_hal::i2c::I2c;
use growbox::{sample, ClimateReading, DeviceClass, Reading, Sample, SensorId};

use crate::adapter::DeviceAdapter;
use crate::bus::{idle, transact, BusDevice, MuxedBus, SharedBus};
use crate::config::BusConfig;
use crate::error::DeviceError;

pub const REG_CHIP_ID: u8 = 0xD0;
pub const REG_CALIB_00: u8 = 0x88;
pub const REG_CALIB_26: u8 = 0xE1;
pub const REG_CTRL_HUM: u8 = 0xF2;
pub const REG_STATUS: u8 = 0xF3;
pub const REG_CTRL_MEAS: u8 = 0xF4;
pub const REG_DATA: u8 = 0xF7;

pub const CHIP_ID_BME280: u8 = 0x60;
pub const CHIP_ID_BMP280: u8 = 0x58;

pub const CALIB_00_LEN: usize = 26;
pub const CALIB_26_LEN: usize = 7;
pub const DATA_LEN: usize = 8;

/// Humidity oversampling x1
const CTRL_HUM_X1: u8 = 0x01;
/// Temperature and pressure oversampling x1, forced mode
const CTRL_MEAS_FORCED: u8 = 0x25;
/// Worst-case conversion time at x1 oversampling is 9.3 ms
const CONVERSION_TIME: Duration = Duration::from_millis(10);

/// ADC reset values, reported when a conversion was skipped
pub const SKIPPED_TEMPERATURE: u32 = 0x80000;
pub const SKIPPED_HUMIDITY: u32 = 0x8000;

/// Supported chip variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipModel {
    Bme280,
    Bmp280,
}

impl ChipModel {
    pub fn from_id(id: u8) -> Result<Self, DeviceError> {
        match id {
            CHIP_ID_BME280 => Ok(ChipModel::Bme280),
            CHIP_ID_BMP280 => Ok(ChipModel::Bmp280),
            other => Err(DeviceError::UnexpectedChipId(other)),
        }
    }

    pub fn has_humidity(&self) -> bool {
        matches!(self, ChipModel::Bme280)
    }
}

fn read_registers<I: I2c>(
    i2c: &mut I,
    address: u8,
    register: u8,
    buf: &mut [u8],
) -> Result<(), DeviceError> {
    i2c.write_read(address, &[register], buf)
        .map_err(|e| DeviceError::from_i2c(&e))
}

fn write_register<I: I2c>(i2c: &mut I, address: u8, register: u8, value: u8) -> Result<(), DeviceError> {
    i2c.write(address, &[register, value])
        .map_err(|e| DeviceError::from_i2c(&e))
}

/// Read and identify the chip at `address`
pub fn identify<I: I2c>(i2c: &mut I, address: u8) -> Result<ChipModel, DeviceError> {
    let mut id = [0u8; 1];
    read_registers(i2c, address, REG_CHIP_ID, &mut id)?;
    ChipModel::from_id(id[0])
}

/// Factory trimming parameters of one chip
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub model: ChipModel,
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,
    pub h1: u8,
    pub h2: i16,
    pub h3: u8,
    pub h4: i16,
    pub h5: i16,
    pub h6: i8,
}

impl Calibration {
    /// Decode the two calibration blocks (`0x88..=0xA1` and `0xE1..=0xE7`)
    pub fn from_registers(
        model: ChipModel,
        block0: &[u8; CALIB_00_LEN],
        block1: &[u8; CALIB_26_LEN],
    ) -> Self {
        let u16_at = |b: &[u8], i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        let i16_at = |b: &[u8], i: usize| i16::from_le_bytes([b[i], b[i + 1]]);

        let (h1, h2, h3, h4, h5, h6) = if model.has_humidity() {
            (
                block0[25],
                i16_at(block1, 0),
                block1[2],
                ((block1[3] as i8 as i16) << 4) | (block1[4] & 0x0F) as i16,
                ((block1[5] as i8 as i16) << 4) | (block1[4] >> 4) as i16,
                block1[6] as i8,
            )
        } else {
            (0, 0, 0, 0, 0, 0)
        };

        Self {
            model,
            t1: u16_at(block0, 0),
            t2: i16_at(block0, 2),
            t3: i16_at(block0, 4),
            h1,
            h2,
            h3,
            h4,
            h5,
            h6,
        }
    }

    /// Identify the chip and read its calibration blocks
    pub fn read<I: I2c>(i2c: &mut I, address: u8) -> Result<Self, DeviceError> {
        let model = identify(i2c, address)?;
        let mut block0 = [0u8; CALIB_00_LEN];
        let mut block1 = [0u8; CALIB_26_LEN];
        read_registers(i2c, address, REG_CALIB_00, &mut block0)?;
        if model.has_humidity() {
            read_registers(i2c, address, REG_CALIB_26, &mut block1)?;
        }
        Ok(Self::from_registers(model, &block0, &block1))
    }

    /// Temperature in °C and the `t_fine` carry used by humidity
    pub fn compensate_temperature(&self, adc_t: u32) -> (f64, f64) {
        let adc = adc_t as f64;
        let t1 = self.t1 as f64;
        let var1 = (adc / 16384.0 - t1 / 1024.0) * self.t2 as f64;
        let delta = adc / 131072.0 - t1 / 8192.0;
        let var2 = delta * delta * self.t3 as f64;
        let t_fine = var1 + var2;
        (t_fine / 5120.0, t_fine)
    }

    /// Relative humidity in %, clamped to `0..=100`
    pub fn compensate_humidity(&self, adc_h: u32, t_fine: f64) -> f64 {
        let var = t_fine - 76800.0;
        let var = (adc_h as f64 - (self.h4 as f64 * 64.0 + self.h5 as f64 / 16384.0 * var))
            * (self.h2 as f64 / 65536.0
                * (1.0
                    + self.h6 as f64 / 67108864.0
                        * var
                        * (1.0 + self.h3 as f64 / 67108864.0 * var)));
        let var = var * (1.0 - self.h1 as f64 * var / 524288.0);
        var.clamp(0.0, 100.0)
    }
}

/// Raw ADC words of one conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMeasurement {
    pub adc_t: u32,
    pub adc_h: u32,
}

impl RawMeasurement {
    /// Unpack the `0xF7..=0xFE` burst (pressure, temperature, humidity)
    pub fn from_data(data: &[u8; DATA_LEN]) -> Self {
        let adc_t = ((data[3] as u32) << 12) | ((data[4] as u32) << 4) | ((data[5] as u32) >> 4);
        let adc_h = ((data[6] as u32) << 8) | data[7] as u32;
        Self { adc_t, adc_h }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Turn raw ADC words into a reading rounded to two decimals
pub fn compensate(cal: &Calibration, raw: RawMeasurement) -> Result<ClimateReading, DeviceError> {
    if raw.adc_t == SKIPPED_TEMPERATURE {
        return Err(DeviceError::MeasurementSkipped);
    }
    let (temperature, t_fine) = cal.compensate_temperature(raw.adc_t);
    let humidity = if cal.model.has_humidity() && raw.adc_h != SKIPPED_HUMIDITY {
        Some(round2(cal.compensate_humidity(raw.adc_h, t_fine)))
    } else {
        None
    };
    Ok(ClimateReading {
        temperature: Some(round2(temperature)),
        humidity,
    })
}

/// Trigger a forced-mode conversion and read the result
pub fn measure<I: I2c>(
    i2c: &mut I,
    address: u8,
    cal: &Calibration,
) -> Result<ClimateReading, DeviceError> {
    if cal.model.has_humidity() {
        write_register(i2c, address, REG_CTRL_HUM, CTRL_HUM_X1)?;
    }
    write_register(i2c, address, REG_CTRL_MEAS, CTRL_MEAS_FORCED)?;
    thread::sleep(CONVERSION_TIME);

    let mut data = [0u8; DATA_LEN];
    read_registers(i2c, address, REG_DATA, &mut data)?;
    compensate(cal, RawMeasurement::from_data(&data))
}

/// Climate adapter for BME280/BMP280 chips behind a multiplexed bus
pub struct Bme280Adapter<I> {
    bus: SharedBus<I>,
    channels: Vec<u8>,
    addresses: Vec<u8>,
}

impl<I: I2c + Send + 'static> Bme280Adapter<I> {
    pub fn new(bus: SharedBus<I>, config: &BusConfig) -> Self {
        Self {
            bus,
            channels: config.scan_channels(),
            addresses: config.addresses.clone(),
        }
    }

    pub fn bus(&self) -> &SharedBus<I> {
        &self.bus
    }
}

fn read_device<I: I2c>(bus: &mut MuxedBus<I>, device: BusDevice) -> Result<ClimateReading, DeviceError> {
    bus.select(device.channel)?;
    let cal = bus.calibration(device.channel, device.address)?;
    measure(bus.i2c_mut(), device.address, &cal)
}

impl<I: I2c + Send + 'static> DeviceAdapter for Bme280Adapter<I> {
    type Device = BusDevice;

    fn class(&self) -> DeviceClass {
        DeviceClass::Climate
    }

    fn candidates(&self) -> Vec<BusDevice> {
        self.channels
            .iter()
            .flat_map(|&channel| {
                self.addresses
                    .iter()
                    .map(move |&address| BusDevice { channel, address })
            })
            .collect()
    }

    fn sensor_id(&self, device: &BusDevice) -> SensorId {
        SensorId::for_bus(device.channel, device.address)
    }

    fn ready(&self) -> impl Future<Output = ()> + Send {
        let bus = Arc::clone(&self.bus);
        async move { idle(&bus).await }
    }

    fn probe(&self, device: &BusDevice) -> impl Future<Output = Result<(), DeviceError>> + Send {
        let bus = Arc::clone(&self.bus);
        let device = *device;
        async move {
            let model = transact(&bus, move |bus| {
                bus.select(device.channel)?;
                identify(bus.i2c_mut(), device.address)
            })
            .await?;
            log::debug!(
                "{:?} at channel {} address 0x{:02x}",
                model,
                device.channel,
                device.address
            );
            Ok(())
        }
    }

    fn read(&self, device: &BusDevice) -> impl Future<Output = Result<Sample, DeviceError>> + Send {
        let bus = Arc::clone(&self.bus);
        let device = *device;
        let sensor_id = self.sensor_id(&device);
        async move {
            let reading = transact(&bus, move |bus| read_device(bus, device)).await?;
            Ok(Sample::new(sensor_id, sample::now(), Reading::Climate(reading)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn reference() -> Calibration {
        Calibration {
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
        }
    }

    #[test]
    fn test_chip_model_from_id() {
        assert_eq!(ChipModel::from_id(0x60).unwrap(), ChipModel::Bme280);
        assert_eq!(ChipModel::from_id(0x58).unwrap(), ChipModel::Bmp280);
        assert!(matches!(
            ChipModel::from_id(0x55),
            Err(DeviceError::UnexpectedChipId(0x55))
        ));
    }

    #[test]
    fn test_temperature_compensation_datasheet_value() {
        let (t, _) = reference().compensate_temperature(519888);
        assert_relative_eq!(t, 25.08, epsilon = 0.005);
    }

    #[test]
    fn test_humidity_compensation() {
        let cal = reference();
        let (_, t_fine) = cal.compensate_temperature(519888);
        assert_relative_eq!(cal.compensate_humidity(30000, t_fine), 55.0, epsilon = 0.01);
        assert_eq!(cal.compensate_humidity(0, t_fine), 0.0);
        assert_eq!(cal.compensate_humidity(60000, t_fine), 100.0);
    }

    #[test]
    fn test_calibration_decoding() {
        let mut block0 = [0u8; CALIB_00_LEN];
        block0[0..2].copy_from_slice(&27504u16.to_le_bytes());
        block0[2..4].copy_from_slice(&26435i16.to_le_bytes());
        block0[4..6].copy_from_slice(&(-1000i16).to_le_bytes());
        block0[25] = 75;
        // H4 = 313 = 0x139, H5 = 50 = 0x032
        let block1 = [0x6A, 0x01, 0x00, 0x13, 0x29, 0x03, 30];

        let cal = Calibration::from_registers(ChipModel::Bme280, &block0, &block1);
        assert_eq!(cal, reference());
    }

    #[test]
    fn test_calibration_negative_h4_h5() {
        let block0 = [0u8; CALIB_00_LEN];
        // H4 = -16 (0xFF0 as 12-bit), H5 = -1
        let block1 = [0, 0, 0, 0xFF, 0xF0, 0xFF, 0xF6];
        let cal = Calibration::from_registers(ChipModel::Bme280, &block0, &block1);
        assert_eq!(cal.h4, -16);
        assert_eq!(cal.h5, -1);
        assert_eq!(cal.h6, -10);
    }

    #[test]
    fn test_raw_measurement_unpacking() {
        // adc_t = 0x7EED0 = 519888, adc_h = 0x7530 = 30000
        let data = [0x80, 0x00, 0x00, 0x7E, 0xED, 0x00, 0x75, 0x30];
        let raw = RawMeasurement::from_data(&data);
        assert_eq!(raw.adc_t, 519888);
        assert_eq!(raw.adc_h, 30000);
    }

    #[test]
    fn test_compensate_rounds_and_flags_skips() {
        let cal = reference();
        let reading = compensate(
            &cal,
            RawMeasurement {
                adc_t: 519888,
                adc_h: 30000,
            },
        )
        .unwrap();
        assert_eq!(reading.temperature, Some(25.08));
        assert_eq!(reading.humidity, Some(55.0));

        let skipped = compensate(
            &cal,
            RawMeasurement {
                adc_t: SKIPPED_TEMPERATURE,
                adc_h: 30000,
            },
        );
        assert!(matches!(skipped, Err(DeviceError::MeasurementSkipped)));

        let no_hum = compensate(
            &cal,
            RawMeasurement {
                adc_t: 519888,
                adc_h: SKIPPED_HUMIDITY,
            },
        )
        .unwrap();
        assert_eq!(no_hum.humidity, None);
    }

    #[test]
    fn test_bmp280_has_no_humidity() {
        let cal = Calibration {
            model: ChipModel::Bmp280,
            ..reference()
        };
        let reading = compensate(
            &cal,
            RawMeasurement {
                adc_t: 519888,
                adc_h: 30000,
            },
        )
        .unwrap();
        assert_eq!(reading.temperature, Some(25.08));
        assert_eq!(reading.humidity, None);
    }
}
