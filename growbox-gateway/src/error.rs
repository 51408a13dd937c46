// Growbox Gateway - Sensor acquisition layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for Growbox Gateway

use std::time::Duration;

use embedded_hal::i2c::{self, ErrorKind, NoAcknowledgeSource};
use growbox::{ConfigError, DeviceClass, SensorId, StorageError};
use thiserror::Error;

/// A failed probe or read of a single device.
///
/// Always recoverable: the scheduler skips the device for the current cycle.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Nothing acknowledged the device address
    #[error("No acknowledge from device")]
    NoAcknowledge,

    /// Any other bus-level failure
    #[error("I2C bus error: {0:?}")]
    Bus(ErrorKind),

    /// Chip id register holds an unsupported value
    #[error("Unexpected chip id 0x{0:02x}")]
    UnexpectedChipId(u8),

    /// Device returned its reset value instead of a measurement
    #[error("Measurement skipped by device")]
    MeasurementSkipped,

    /// Read did not complete within the per-device timeout
    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    /// Bus lock poisoned or worker thread lost
    #[error("Bus unavailable: {0}")]
    BusUnavailable(String),

    /// Power meter request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Power meter answered with something unusable
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl DeviceError {
    /// Map a HAL bus error onto a device error
    pub fn from_i2c<E: i2c::Error>(err: &E) -> Self {
        match err.kind() {
            ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)
            | ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown) => DeviceError::NoAcknowledge,
            kind => DeviceError::Bus(kind),
        }
    }

    /// Whether the device looks absent rather than misbehaving
    pub fn is_absent(&self) -> bool {
        matches!(self, DeviceError::NoAcknowledge)
    }
}

/// Main error type for Gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Invalid or missing configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Store failure outside the acquisition loop
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Scan required sensors but found none
    #[error("No {0} sensors found")]
    NoSensors(DeviceClass),

    /// Two candidates resolved to the same identity
    #[error("Sensor already registered: {0}")]
    DuplicateSensor(SensorId),

    /// Bus device could not be opened
    #[error("Failed to open bus {path}: {reason}")]
    BusOpen { path: String, reason: String },

    /// Device failure surfaced outside a cycle
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// Result type alias for Gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
