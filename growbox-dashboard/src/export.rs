// Growbox Dashboard - CSV export
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Full-store CSV dump.
//!
//! Climate rows carry `temperature` and `humidity`; with the power class
//! enabled, meter rows are interleaved by timestamp and carry `apower` and
//! `aenergy`. Columns a row does not measure stay empty.

use growbox::sample::format_timestamp;
use growbox::{Reading, ReadingRow};
use serde::Serialize;

/// Download name of the attachment
pub const EXPORT_FILENAME: &str = "sensor_data.csv";

const CLIMATE_HEADER: [&str; 4] = ["timestamp", "sensor_id", "temperature", "humidity"];
const FULL_HEADER: [&str; 6] = [
    "timestamp",
    "sensor_id",
    "temperature",
    "humidity",
    "apower",
    "aenergy",
];

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Serialize)]
struct ClimateRecord<'a> {
    timestamp: String,
    sensor_id: &'a str,
    temperature: Option<f64>,
    humidity: Option<f64>,
}

#[derive(Serialize)]
struct FullRecord<'a> {
    timestamp: String,
    sensor_id: &'a str,
    temperature: Option<f64>,
    humidity: Option<f64>,
    apower: Option<f64>,
    aenergy: Option<f64>,
}

fn full_record(row: &ReadingRow) -> FullRecord<'_> {
    let sample = &row.sample;
    let mut record = FullRecord {
        timestamp: format_timestamp(&sample.timestamp),
        sensor_id: sample.sensor_id.as_str(),
        temperature: None,
        humidity: None,
        apower: None,
        aenergy: None,
    };
    match sample.reading {
        Reading::Climate(c) => {
            record.temperature = c.temperature;
            record.humidity = c.humidity;
        }
        Reading::Power(p) => {
            record.apower = p.apower;
            record.aenergy = p.aenergy;
        }
    }
    record
}

/// Render the dump. `power` is `None` when the power class is disabled.
///
/// Both inputs are expected in store order (timestamp, then id); the merge
/// keeps climate rows ahead of power rows sharing a timestamp.
pub fn write_csv(
    climate: &[ReadingRow],
    power: Option<&[ReadingRow]>,
) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    match power {
        None => {
            writer.write_record(CLIMATE_HEADER)?;
            for row in climate {
                let sample = &row.sample;
                writer.serialize(ClimateRecord {
                    timestamp: format_timestamp(&sample.timestamp),
                    sensor_id: sample.sensor_id.as_str(),
                    temperature: sample.temperature(),
                    humidity: sample.humidity(),
                })?;
            }
        }
        Some(power) => {
            writer.write_record(FULL_HEADER)?;
            let mut rows: Vec<&ReadingRow> = climate.iter().chain(power.iter()).collect();
            rows.sort_by_key(|row| row.sample.timestamp);
            for row in rows {
                writer.serialize(full_record(row))?;
            }
        }
    }

    writer.into_inner().map_err(|e| ExportError::Io(e.into_error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use growbox::sample::from_unix;
    use growbox::{PowerReading, Sample};

    fn climate(id: i64, secs: i64, sensor: &str, t: Option<f64>, h: Option<f64>) -> ReadingRow {
        ReadingRow {
            id,
            sample: Sample::climate(sensor, from_unix(secs).unwrap(), t, h),
        }
    }

    fn power(id: i64, secs: i64, watts: f64) -> ReadingRow {
        ReadingRow {
            id,
            sample: Sample::power(
                "lamp",
                from_unix(secs).unwrap(),
                PowerReading {
                    apower: Some(watts),
                    aenergy: Some(1200.5),
                    temperature: Some(40.0),
                },
            ),
        }
    }

    #[test]
    fn test_empty_store_gives_header_only() {
        let csv = String::from_utf8(write_csv(&[], None).unwrap()).unwrap();
        assert_eq!(csv, "timestamp,sensor_id,temperature,humidity\n");
    }

    #[test]
    fn test_climate_rows() {
        let rows = vec![
            climate(1, 1_700_000_000, "CH0-0x76", Some(23.4), Some(61.0)),
            climate(2, 1_700_000_060, "CH1-0x77", Some(21.0), None),
        ];
        let csv = String::from_utf8(write_csv(&rows, None).unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "2023-11-14 22:13:20,CH0-0x76,23.4,61.0");
        assert_eq!(lines[2], "2023-11-14 22:14:20,CH1-0x77,21.0,");
    }

    #[test]
    fn test_power_rows_interleaved_by_timestamp() {
        let climate_rows = vec![
            climate(1, 1_700_000_000, "CH0-0x76", Some(23.4), Some(61.0)),
            climate(2, 1_700_000_060, "CH0-0x76", Some(23.5), Some(60.5)),
        ];
        let power_rows = vec![power(1, 1_700_000_030, 95.0), power(2, 1_700_000_060, 96.0)];

        let csv = String::from_utf8(write_csv(&climate_rows, Some(&power_rows)).unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "timestamp,sensor_id,temperature,humidity,apower,aenergy"
        );
        assert_eq!(lines[1], "2023-11-14 22:13:20,CH0-0x76,23.4,61.0,,");
        assert_eq!(lines[2], "2023-11-14 22:13:50,lamp,,,95.0,1200.5");
        assert_eq!(lines[3], "2023-11-14 22:14:20,CH0-0x76,23.5,60.5,,");
        assert_eq!(lines[4], "2023-11-14 22:14:20,lamp,,,96.0,1200.5");
    }
}
