// Growbox Gateway - Sensor acquisition layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for Growbox Gateway

use std::path::PathBuf;
use std::time::Duration;

use growbox::ConfigError;

/// Default TCA9548A / PCA9548A address
pub const DEFAULT_MUX_ADDRESS: u8 = 0x70;

/// BME280 primary and secondary addresses
pub const BME280_ADDRESSES: [u8; 2] = [0x76, 0x77];

/// I2C bus and multiplexer layout
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Bus device node
    pub device: PathBuf,

    /// Multiplexer address, `None` when sensors sit directly on the bus
    pub mux_address: Option<u8>,

    /// Multiplexer channels to scan (0-7)
    pub channels: Vec<u8>,

    /// Device addresses to probe on every channel
    pub addresses: Vec<u8>,

    /// Wait after switching channels before talking to a device
    pub settle_delay: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/i2c-1"),
            mux_address: Some(DEFAULT_MUX_ADDRESS),
            channels: vec![0, 1],
            addresses: BME280_ADDRESSES.to_vec(),
            settle_delay: Duration::from_millis(2),
        }
    }
}

impl BusConfig {
    /// Sensors wired straight to the bus, no multiplexer
    pub fn direct() -> Self {
        Self {
            mux_address: None,
            channels: vec![0],
            ..Default::default()
        }
    }

    /// Channels actually scanned: every configured channel behind a mux,
    /// channel 0 otherwise.
    pub fn scan_channels(&self) -> Vec<u8> {
        match self.mux_address {
            Some(_) => self.channels.clone(),
            None => vec![0],
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addresses.is_empty() {
            return Err(ConfigError::Missing("device addresses"));
        }
        if let Some(addr) = self.addresses.iter().find(|a| **a > 0x7F) {
            return Err(ConfigError::invalid(
                "addresses",
                format!("0x{:02x} is not a 7-bit address", addr),
            ));
        }
        if let Some(mux) = self.mux_address {
            if mux > 0x7F {
                return Err(ConfigError::invalid(
                    "mux_address",
                    format!("0x{:02x} is not a 7-bit address", mux),
                ));
            }
            if self.addresses.contains(&mux) {
                return Err(ConfigError::invalid(
                    "mux_address",
                    "multiplexer address collides with a device address",
                ));
            }
            if self.channels.is_empty() {
                return Err(ConfigError::Missing("mux channels"));
            }
            if let Some(ch) = self.channels.iter().find(|c| **c > 7) {
                return Err(ConfigError::invalid(
                    "channels",
                    format!("channel {} out of range 0-7", ch),
                ));
            }
        }
        Ok(())
    }
}

/// Acquisition loop configuration for one device class
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between two cycles
    pub period: Duration,

    /// Upper bound for one device probe or read
    pub read_timeout: Duration,

    /// Fail the scan when no device answers
    pub require_sensors: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::climate()
    }
}

impl SchedulerConfig {
    /// Environmental loop: one cycle per minute
    pub fn climate() -> Self {
        Self {
            period: Duration::from_secs(60),
            read_timeout: Duration::from_secs(2),
            require_sensors: false,
        }
    }

    /// Power meter loop: one cycle every 30 seconds
    pub fn power() -> Self {
        Self {
            period: Duration::from_secs(30),
            read_timeout: Duration::from_secs(5),
            require_sensors: false,
        }
    }

    /// Create a configuration with a custom period
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period.is_zero() {
            return Err(ConfigError::invalid("period", "sample period must be positive"));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "read_timeout",
                "read timeout must be positive",
            ));
        }
        Ok(())
    }
}

/// One Shelly Gen2 switch to poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerMeterConfig {
    /// Sensor identity the readings are stored under
    pub name: String,

    /// Host, optionally with port
    pub host: String,

    /// Switch component id on the device
    pub switch_id: u32,
}

impl PowerMeterConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            switch_id: 0,
        }
    }

    /// Parse `[name=]host[#switch]`, e.g. `grow-light=192.168.1.40#1`.
    ///
    /// Without a name the meter is called `shelly-<host>`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let (name, rest) = match raw.split_once('=') {
            Some((name, rest)) => (Some(name.trim()), rest.trim()),
            None => (None, raw),
        };
        let (host, switch_id) = match rest.split_once('#') {
            Some((host, id)) => {
                let id = id.trim().parse::<u32>().map_err(|_| {
                    ConfigError::invalid("power_meter", format!("bad switch id in '{}'", raw))
                })?;
                (host.trim(), id)
            }
            None => (rest, 0),
        };
        if host.is_empty() {
            return Err(ConfigError::invalid(
                "power_meter",
                format!("missing host in '{}'", raw),
            ));
        }
        let name = match name {
            Some(n) if !n.is_empty() => n.to_string(),
            Some(_) => {
                return Err(ConfigError::invalid(
                    "power_meter",
                    format!("empty name in '{}'", raw),
                ))
            }
            None => format!("shelly-{}", host),
        };
        Ok(Self {
            name,
            host: host.to_string(),
            switch_id,
        })
    }

    /// RPC URL for the switch status
    pub fn status_url(&self) -> String {
        format!(
            "http://{}/rpc/Switch.GetStatus?id={}",
            self.host, self.switch_id
        )
    }
}
