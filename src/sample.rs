//! Sample and sensor identity types
//!
//! A [`Sample`] is one timestamped reading from one device. Readings come in
//! two shapes, one per device class: climate sensors report temperature and
//! humidity, power meters report active power, accumulated energy and their
//! own temperature. Every metric is optional because a device may answer
//! with a partial measurement; a sample with no usable metric at all is
//! never persisted.

use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Second-resolution UTC timestamp
pub type Timestamp = DateTime<Utc>;

/// Wire format for timestamps in JSON and CSV output
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current time truncated to whole seconds
pub fn now() -> Timestamp {
    truncate(Utc::now())
}

/// Drop sub-second precision
pub fn truncate(ts: Timestamp) -> Timestamp {
    from_unix(ts.timestamp()).unwrap_or(ts)
}

/// Build a timestamp from Unix seconds
pub fn from_unix(secs: i64) -> Option<Timestamp> {
    DateTime::<Utc>::from_timestamp(secs, 0)
}

/// Render a timestamp in [`TIMESTAMP_FORMAT`]
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp given as Unix seconds, RFC 3339, or [`TIMESTAMP_FORMAT`]
/// (interpreted as UTC).
pub fn parse_timestamp(input: &str) -> Option<Timestamp> {
    let input = input.trim();
    if let Ok(secs) = input.parse::<i64>() {
        return from_unix(secs);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(truncate(ts.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(input, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Serde adapter for timestamps in [`TIMESTAMP_FORMAT`]
pub mod wire_time {
    use super::{format_timestamp, parse_timestamp, Timestamp};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &Timestamp, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Timestamp, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}")))
    }
}

/// Stable identity of one physical device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(String);

impl SensorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity of a bus device, derived from its mux channel and address
    pub fn for_bus(channel: u8, address: u8) -> Self {
        Self(format!("CH{}-0x{:02x}", channel, address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SensorId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SensorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SensorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Device class, one acquisition loop and one table each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Climate,
    Power,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Climate => "climate",
            DeviceClass::Power => "power",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Temperature (°C) and relative humidity (%) from a climate sensor
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClimateReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

/// Active power (W), accumulated energy (Wh) and device temperature (°C)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerReading {
    pub apower: Option<f64>,
    pub aenergy: Option<f64>,
    pub temperature: Option<f64>,
}

/// Metric payload of a sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reading {
    Climate(ClimateReading),
    Power(PowerReading),
}

fn usable(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

impl Reading {
    pub fn class(&self) -> DeviceClass {
        match self {
            Reading::Climate(_) => DeviceClass::Climate,
            Reading::Power(_) => DeviceClass::Power,
        }
    }

    /// Whether at least one metric carries a finite value
    pub fn has_metric(&self) -> bool {
        match self.sanitized() {
            Reading::Climate(c) => c.temperature.is_some() || c.humidity.is_some(),
            Reading::Power(p) => {
                p.apower.is_some() || p.aenergy.is_some() || p.temperature.is_some()
            }
        }
    }

    /// Copy of the reading with NaN and infinite values replaced by `None`
    pub fn sanitized(&self) -> Reading {
        match *self {
            Reading::Climate(c) => Reading::Climate(ClimateReading {
                temperature: usable(c.temperature),
                humidity: usable(c.humidity),
            }),
            Reading::Power(p) => Reading::Power(PowerReading {
                apower: usable(p.apower),
                aenergy: usable(p.aenergy),
                temperature: usable(p.temperature),
            }),
        }
    }
}

/// One timestamped reading from one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub sensor_id: SensorId,
    #[serde(with = "wire_time")]
    pub timestamp: Timestamp,
    pub reading: Reading,
}

impl Sample {
    /// Create a sample, truncating the timestamp to whole seconds
    pub fn new(sensor_id: SensorId, timestamp: Timestamp, reading: Reading) -> Self {
        Self {
            sensor_id,
            timestamp: truncate(timestamp),
            reading,
        }
    }

    pub fn climate(
        sensor_id: impl Into<SensorId>,
        timestamp: Timestamp,
        temperature: Option<f64>,
        humidity: Option<f64>,
    ) -> Self {
        Self::new(
            sensor_id.into(),
            timestamp,
            Reading::Climate(ClimateReading {
                temperature,
                humidity,
            }),
        )
    }

    pub fn power(
        sensor_id: impl Into<SensorId>,
        timestamp: Timestamp,
        reading: PowerReading,
    ) -> Self {
        Self::new(sensor_id.into(), timestamp, Reading::Power(reading))
    }

    pub fn class(&self) -> DeviceClass {
        self.reading.class()
    }

    /// Temperature of either reading shape
    pub fn temperature(&self) -> Option<f64> {
        match self.reading {
            Reading::Climate(c) => c.temperature,
            Reading::Power(p) => p.temperature,
        }
    }

    /// Relative humidity, climate readings only
    pub fn humidity(&self) -> Option<f64> {
        match self.reading {
            Reading::Climate(c) => c.humidity,
            Reading::Power(_) => None,
        }
    }

    /// Whether the store would keep this sample
    pub fn is_persistable(&self) -> bool {
        self.reading.has_metric()
    }
}

/// A persisted sample together with its store-assigned sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingRow {
    pub id: i64,
    pub sample: Sample,
}
