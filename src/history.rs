//! History downsampling
//!
//! Long ranges are cut into `M` equal-width windows by index and each window
//! contributes its minimum and its maximum. Unlike stride sampling this keeps
//! short spikes and dips visible on a chart, at the cost of up to `2 * M`
//! output points. Temperature and humidity are reduced independently since
//! their extrema rarely share a timestamp.
//!
//! # Example
//!
//! ```rust
//! use growbox::history::downsample_min_max;
//!
//! let values: Vec<f64> = (0..1000).map(|i| (i as f64 / 50.0).sin()).collect();
//! let reduced = downsample_min_max(&values, 100, |v| *v);
//!
//! assert!(reduced.len() <= 200);
//! assert!(reduced.contains(&values.iter().cloned().fold(f64::MIN, f64::max)));
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::config::HistoryConfig;
use crate::sample::{format_timestamp, Sample, SensorId, Timestamp};

/// Reduce `points` to at most `2 * max_windows` entries, keeping each
/// window's minimum and maximum.
///
/// Sequences of length `<= max_windows` are returned unchanged. Otherwise
/// window `i` spans `[i*n/M, (i+1)*n/M)`, the last one ending at `n`. Each
/// window emits its min then its max: the first occurrence of the smallest
/// value and the last occurrence of the largest, so a flat window yields its
/// first and last point. Output keeps this per-window order and is therefore
/// not guaranteed to be chronological.
pub fn downsample_min_max<T, F>(points: &[T], max_windows: usize, value: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&T) -> f64,
{
    let n = points.len();
    let m = max_windows.max(1);
    if n <= m {
        return points.to_vec();
    }

    let mut out = Vec::with_capacity(2 * m);
    for i in 0..m {
        let start = i * n / m;
        let end = if i + 1 == m { n } else { (i + 1) * n / m };
        if start >= end {
            continue;
        }

        let window = &points[start..end];
        let mut min_idx = 0;
        let mut max_idx = 0;
        for (j, point) in window.iter().enumerate().skip(1) {
            let v = value(point);
            if v.total_cmp(&value(&window[min_idx])) == Ordering::Less {
                min_idx = j;
            }
            if v.total_cmp(&value(&window[max_idx])) != Ordering::Less {
                max_idx = j;
            }
        }
        out.push(window[min_idx].clone());
        out.push(window[max_idx].clone());
    }
    out
}

/// Metric selector for a climate sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Temperature,
    Humidity,
}

impl Metric {
    pub fn of(&self, sample: &Sample) -> Option<f64> {
        let value = match self {
            Metric::Temperature => sample.temperature(),
            Metric::Humidity => sample.humidity(),
        };
        value.filter(|v| v.is_finite())
    }
}

/// One point of a single-metric series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub timestamp: Timestamp,
    pub value: f64,
}

/// Downsampled chart data for one sensor
///
/// Serializes as `{timestamps, temp, hum, hum_timestamps}`: `timestamps`
/// pairs with `temp` and `hum_timestamps` with `hum`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorHistory {
    pub temperature: Vec<SeriesPoint>,
    pub humidity: Vec<SeriesPoint>,
}

impl SensorHistory {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_empty() && self.humidity.is_empty()
    }
}

fn split(points: &[SeriesPoint]) -> (Vec<String>, Vec<f64>) {
    points
        .iter()
        .map(|p| (format_timestamp(&p.timestamp), p.value))
        .unzip()
}

impl Serialize for SensorHistory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (timestamps, temp) = split(&self.temperature);
        let (hum_timestamps, hum) = split(&self.humidity);

        let mut state = serializer.serialize_struct("SensorHistory", 4)?;
        state.serialize_field("timestamps", &timestamps)?;
        state.serialize_field("temp", &temp)?;
        state.serialize_field("hum", &hum)?;
        state.serialize_field("hum_timestamps", &hum_timestamps)?;
        state.end()
    }
}

/// Turns raw store ranges into per-sensor chart series
#[derive(Debug, Clone, Default)]
pub struct HistoryEngine {
    config: HistoryConfig,
}

impl HistoryEngine {
    pub fn new(config: HistoryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Downsample one metric of one sensor's samples, in source order.
    ///
    /// Samples lacking the metric are skipped.
    pub fn downsample_metric(&self, samples: &[&Sample], metric: Metric) -> Vec<SeriesPoint> {
        let points: Vec<SeriesPoint> = samples
            .iter()
            .filter_map(|s| {
                metric.of(s).map(|value| SeriesPoint {
                    timestamp: s.timestamp,
                    value,
                })
            })
            .collect();
        downsample_min_max(&points, self.config.max_points, |p| p.value)
    }

    /// Group `samples` (ordered by timestamp) by sensor and downsample each
    /// metric separately. Each series is then sorted by timestamp; the sort
    /// is stable so min-then-max order survives equal timestamps.
    pub fn build(&self, samples: &[Sample]) -> BTreeMap<SensorId, SensorHistory> {
        let mut grouped: BTreeMap<&SensorId, Vec<&Sample>> = BTreeMap::new();
        for sample in samples {
            grouped.entry(&sample.sensor_id).or_default().push(sample);
        }

        grouped
            .into_iter()
            .map(|(sensor, series)| {
                let mut temperature = self.downsample_metric(&series, Metric::Temperature);
                let mut humidity = self.downsample_metric(&series, Metric::Humidity);
                temperature.sort_by_key(|p| p.timestamp);
                humidity.sort_by_key(|p| p.timestamp);
                (
                    sensor.clone(),
                    SensorHistory {
                        temperature,
                        humidity,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::from_unix;

    fn ts(secs: i64) -> Timestamp {
        from_unix(secs).unwrap()
    }

    #[test]
    fn test_short_series_unchanged() {
        let values = vec![3.0, 1.0, 2.0];
        assert_eq!(downsample_min_max(&values, 3, |v| *v), values);
        assert_eq!(downsample_min_max(&values, 10, |v| *v), values);
    }

    #[test]
    fn test_empty_series() {
        let values: Vec<f64> = Vec::new();
        assert!(downsample_min_max(&values, 5, |v| *v).is_empty());
    }

    #[test]
    fn test_min_then_max_per_window() {
        // Two windows of three: [5, 9, 1] and [4, 4, 7]
        let values = vec![5.0, 9.0, 1.0, 4.0, 4.0, 7.0];
        let out = downsample_min_max(&values, 2, |v| *v);
        assert_eq!(out, vec![1.0, 9.0, 4.0, 7.0]);
    }

    #[test]
    fn test_flat_window_uses_first_and_last() {
        let points: Vec<(usize, f64)> = (0..8).map(|i| (i, 2.0)).collect();
        let out = downsample_min_max(&points, 2, |p| p.1);
        let indices: Vec<usize> = out.iter().map(|p| p.0).collect();
        assert_eq!(indices, vec![0, 3, 4, 7]);
    }

    #[test]
    fn test_last_window_absorbs_remainder() {
        // n = 10, m = 3: windows [0,3), [3,6), [6,10)
        let points: Vec<(usize, f64)> = (0..10).map(|i| (i, i as f64)).collect();
        let out = downsample_min_max(&points, 3, |p| p.1);
        let indices: Vec<usize> = out.iter().map(|p| p.0).collect();
        assert_eq!(indices, vec![0, 2, 3, 5, 6, 9]);
    }

    #[test]
    fn test_zero_cap_treated_as_one() {
        let values = vec![2.0, 8.0, 5.0];
        assert_eq!(downsample_min_max(&values, 0, |v| *v), vec![2.0, 8.0]);
    }

    #[test]
    fn test_metrics_downsampled_independently() {
        // Temperature peaks early, humidity peaks late
        let samples: Vec<Sample> = (0..20)
            .map(|i| {
                let temp = if i == 2 { 40.0 } else { 20.0 };
                let hum = if i == 17 { 90.0 } else { 50.0 };
                Sample::climate("s", ts(i * 60), Some(temp), Some(hum))
            })
            .collect();

        let engine = HistoryEngine::new(HistoryConfig::with_max_points(2));
        let history = engine.build(&samples);
        let s = &history[&SensorId::new("s")];

        assert!(s.temperature.iter().any(|p| p.value == 40.0 && p.timestamp == ts(120)));
        assert!(s.humidity.iter().any(|p| p.value == 90.0 && p.timestamp == ts(17 * 60)));
        assert!(s.temperature.len() <= 4);
        assert!(s.humidity.len() <= 4);
    }

    #[test]
    fn test_build_sorts_series_chronologically() {
        // Window max precedes window min, so raw output is out of order
        let samples: Vec<Sample> = [30.0, 10.0, 20.0, 25.0]
            .iter()
            .enumerate()
            .map(|(i, v)| Sample::climate("s", ts(i as i64), Some(*v), None))
            .collect();

        let engine = HistoryEngine::new(HistoryConfig::with_max_points(1));
        let history = engine.build(&samples);
        let temps = &history[&SensorId::new("s")].temperature;

        let times: Vec<i64> = temps.iter().map(|p| p.timestamp.timestamp()).collect();
        assert_eq!(times, vec![0, 1]);
        assert!(history[&SensorId::new("s")].humidity.is_empty());
    }

    #[test]
    fn test_missing_values_skipped() {
        let samples = vec![
            Sample::climate("s", ts(0), Some(21.0), None),
            Sample::climate("s", ts(60), None, Some(55.0)),
        ];
        let engine = HistoryEngine::default();
        let history = engine.build(&samples);
        let s = &history[&SensorId::new("s")];
        assert_eq!(s.temperature.len(), 1);
        assert_eq!(s.humidity.len(), 1);
    }

    #[test]
    fn test_history_serialization_shape() {
        let history = SensorHistory {
            temperature: vec![SeriesPoint {
                timestamp: ts(0),
                value: 21.5,
            }],
            humidity: vec![],
        };
        let json = serde_json::to_value(&history).unwrap();
        assert_eq!(json["timestamps"][0], "1970-01-01 00:00:00");
        assert_eq!(json["temp"][0], 21.5);
        assert!(json["hum"].as_array().unwrap().is_empty());
        assert!(json["hum_timestamps"].as_array().unwrap().is_empty());
    }
}
