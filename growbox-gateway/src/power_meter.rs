// Growbox Gateway - Sensor acquisition layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Shelly Gen2 power meter adapter
//!
//! Polls `Switch.GetStatus` over the local RPC endpoint and maps active
//! power, accumulated energy and device temperature onto a power reading.

use std::future::Future;
use std::time::Duration;

use growbox::{sample, DeviceClass, PowerReading, Sample, SensorId};
use serde::Deserialize;

use crate::adapter::DeviceAdapter;
use crate::config::PowerMeterConfig;
use crate::error::{DeviceError, Result};

/// `Switch.GetStatus` response, reduced to the fields recorded
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwitchStatus {
    #[serde(default)]
    pub apower: Option<f64>,
    #[serde(default)]
    pub aenergy: Option<EnergyCounter>,
    #[serde(default)]
    pub temperature: Option<DeviceTemperature>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnergyCounter {
    /// Total energy in Wh
    #[serde(default)]
    pub total: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceTemperature {
    #[serde(rename = "tC", default)]
    pub celsius: Option<f64>,
}

impl SwitchStatus {
    pub fn parse(body: &str) -> std::result::Result<Self, DeviceError> {
        serde_json::from_str(body).map_err(|e| DeviceError::InvalidResponse(e.to_string()))
    }

    pub fn reading(&self) -> PowerReading {
        PowerReading {
            apower: self.apower,
            aenergy: self.aenergy.as_ref().and_then(|e| e.total),
            temperature: self.temperature.as_ref().and_then(|t| t.celsius),
        }
    }
}

/// Adapter polling one or more Shelly switches
pub struct ShellyAdapter {
    client: reqwest::Client,
    meters: Vec<PowerMeterConfig>,
}

impl ShellyAdapter {
    pub fn new(meters: Vec<PowerMeterConfig>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(DeviceError::Http)?;
        Ok(Self { client, meters })
    }

    pub fn meters(&self) -> &[PowerMeterConfig] {
        &self.meters
    }

    fn fetch(
        &self,
        meter: &PowerMeterConfig,
    ) -> impl Future<Output = std::result::Result<SwitchStatus, DeviceError>> + Send {
        let request = self.client.get(meter.status_url());
        async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(DeviceError::InvalidResponse(format!("HTTP {}", status)));
            }
            let body = response.text().await?;
            SwitchStatus::parse(&body)
        }
    }
}

impl DeviceAdapter for ShellyAdapter {
    type Device = PowerMeterConfig;

    fn class(&self) -> DeviceClass {
        DeviceClass::Power
    }

    fn candidates(&self) -> Vec<PowerMeterConfig> {
        self.meters.clone()
    }

    fn sensor_id(&self, meter: &PowerMeterConfig) -> SensorId {
        SensorId::new(meter.name.clone())
    }

    fn probe(
        &self,
        meter: &PowerMeterConfig,
    ) -> impl Future<Output = std::result::Result<(), DeviceError>> + Send {
        let fetch = self.fetch(meter);
        async move { fetch.await.map(|_| ()) }
    }

    fn read(
        &self,
        meter: &PowerMeterConfig,
    ) -> impl Future<Output = std::result::Result<Sample, DeviceError>> + Send {
        let sensor_id = self.sensor_id(meter);
        let fetch = self.fetch(meter);
        async move {
            let status = fetch.await?;
            Ok(Sample::power(sensor_id, sample::now(), status.reading()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = r#"{
        "id": 0,
        "source": "HTTP_in",
        "output": true,
        "apower": 118.4,
        "voltage": 229.8,
        "current": 0.521,
        "aenergy": {"total": 5234.112, "by_minute": [1.9, 1.9, 1.9], "minute_ts": 1718000000},
        "temperature": {"tC": 41.2, "tF": 106.2}
    }"#;

    #[test]
    fn test_parse_switch_status() {
        let reading = SwitchStatus::parse(STATUS).unwrap().reading();
        assert_eq!(reading.apower, Some(118.4));
        assert_eq!(reading.aenergy, Some(5234.112));
        assert_eq!(reading.temperature, Some(41.2));
    }

    #[test]
    fn test_parse_partial_status() {
        let reading = SwitchStatus::parse(r#"{"id": 0, "output": false}"#)
            .unwrap()
            .reading();
        assert_eq!(reading, PowerReading::default());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            SwitchStatus::parse("<html>"),
            Err(DeviceError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_candidates_use_configured_names() {
        let adapter = ShellyAdapter::new(
            vec![
                PowerMeterConfig::new("lamp", "10.0.0.2"),
                PowerMeterConfig::new("fan", "10.0.0.3"),
            ],
            Duration::from_secs(1),
        )
        .unwrap();
        let ids: Vec<SensorId> = adapter
            .candidates()
            .iter()
            .map(|m| adapter.sensor_id(m))
            .collect();
        assert_eq!(ids, vec![SensorId::new("lamp"), SensorId::new("fan")]);
        assert_eq!(adapter.class(), DeviceClass::Power);
    }
}
