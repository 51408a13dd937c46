//! SQLite time-series store
//!
//! One table per device class, each row carrying an autoincrement id that
//! orders rows whose timestamps collide. The database runs in WAL mode with
//! two connections: a writer for inserts, prunes and clears, and a read-only
//! connection for queries, so history requests are not held up by the
//! acquisition loops. Every write transaction covers a single insert or a
//! single prune.
//!
//! # Example
//!
//! ```no_run
//! use growbox::{sample, Sample, Store, StoreConfig};
//!
//! let store = Store::open(StoreConfig::with_path("sensors.db")).unwrap();
//! store
//!     .append(&Sample::climate("CH0-0x76", sample::now(), Some(23.4), Some(61.0)))
//!     .unwrap();
//!
//! for (sensor, latest) in store.latest_per_sensor(None).unwrap() {
//!     println!("{}: {:?}", sensor, latest.temperature());
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use rusqlite::{Connection, OpenFlags, OptionalExtension, Row};

use crate::config::StoreConfig;
use crate::error::{ConfigError, Result, StorageError};
use crate::sample::{self, PowerReading, Reading, ReadingRow, Sample, SensorId, Timestamp};

/// DDL for both reading tables.
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS climate_readings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    sensor_id   TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,
    temperature REAL,
    humidity    REAL
);
CREATE INDEX IF NOT EXISTS idx_climate_sensor ON climate_readings (sensor_id);
CREATE INDEX IF NOT EXISTS idx_climate_sensor_ts ON climate_readings (sensor_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_climate_ts ON climate_readings (timestamp);

CREATE TABLE IF NOT EXISTS power_readings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    sensor_id   TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,
    apower      REAL,
    aenergy     REAL,
    temperature REAL
);
CREATE INDEX IF NOT EXISTS idx_power_sensor ON power_readings (sensor_id);
CREATE INDEX IF NOT EXISTS idx_power_ts ON power_readings (timestamp);
";

const CLIMATE_COLUMNS: &str = "id, sensor_id, timestamp, temperature, humidity";
const POWER_COLUMNS: &str = "id, sensor_id, timestamp, apower, aenergy, temperature";

/// Oldest timestamp a row may carry under `retention`
fn retention_cutoff(retention: std::time::Duration) -> Result<Timestamp> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|window| sample::now().checked_sub_signed(window))
        .ok_or_else(|| ConfigError::invalid("retention", "outside the timestamp range").into())
}

fn row_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let secs: i64 = row.get(idx)?;
    sample::from_unix(secs).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

fn climate_row(row: &Row<'_>) -> rusqlite::Result<ReadingRow> {
    let sensor_id: String = row.get(1)?;
    Ok(ReadingRow {
        id: row.get(0)?,
        sample: Sample::climate(sensor_id, row_timestamp(row, 2)?, row.get(3)?, row.get(4)?),
    })
}

fn power_row(row: &Row<'_>) -> rusqlite::Result<ReadingRow> {
    let sensor_id: String = row.get(1)?;
    let reading = PowerReading {
        apower: row.get(3)?,
        aenergy: row.get(4)?,
        temperature: row.get(5)?,
    };
    Ok(ReadingRow {
        id: row.get(0)?,
        sample: Sample::power(sensor_id, row_timestamp(row, 2)?, reading),
    })
}

/// SQLite-backed reading store shared by acquisition loops and HTTP handlers.
pub struct Store {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    config: StoreConfig,
    last_prune: Mutex<Option<Instant>>,
}

impl Store {
    /// Open or create the store described by `config`.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let writer = Connection::open(&config.path)?;
        writer.busy_timeout(config.busy_timeout)?;
        writer.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        writer.execute_batch(SCHEMA)?;

        let reader = Connection::open_with_flags(
            &config.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(config.busy_timeout)?;

        log::info!(
            "Opened store at {} (retention {} days)",
            config.path.display(),
            config.retention.as_secs() / 86_400
        );

        let store = Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            config,
            last_prune: Mutex::new(None),
        };
        store.maybe_prune()?;
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer.lock().map_err(|_| StorageError::Poisoned("writer"))
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader.lock().map_err(|_| StorageError::Poisoned("reader"))
    }

    /// Persist a sample and return its row id.
    ///
    /// A sample without any finite metric is skipped and yields `Ok(None)`.
    /// Retention pruning runs once at open and then piggybacks on this call
    /// at most once per `prune_interval`; a failed prune here is logged, not
    /// returned.
    pub fn append(&self, sample: &Sample) -> Result<Option<i64>> {
        let reading = sample.reading.sanitized();
        if !reading.has_metric() {
            log::debug!("Skipping empty sample from {}", sample.sensor_id);
            return Ok(None);
        }

        let id = {
            let conn = self.writer()?;
            match reading {
                Reading::Climate(c) => conn.execute(
                    "INSERT INTO climate_readings (sensor_id, timestamp, temperature, humidity) \
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        sample.sensor_id.as_str(),
                        sample.timestamp.timestamp(),
                        c.temperature,
                        c.humidity
                    ],
                )?,
                Reading::Power(p) => conn.execute(
                    "INSERT INTO power_readings (sensor_id, timestamp, apower, aenergy, temperature) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        sample.sensor_id.as_str(),
                        sample.timestamp.timestamp(),
                        p.apower,
                        p.aenergy,
                        p.temperature
                    ],
                )?,
            };
            conn.last_insert_rowid()
        };

        if let Err(e) = self.maybe_prune() {
            log::warn!("Retention prune failed: {}", e);
        }

        Ok(Some(id))
    }

    fn maybe_prune(&self) -> Result<()> {
        let mut last = self
            .last_prune
            .lock()
            .map_err(|_| StorageError::Poisoned("prune clock"))?;
        let due = match *last {
            Some(at) => at.elapsed() >= self.config.prune_interval,
            None => true,
        };
        if !due {
            return Ok(());
        }
        *last = Some(Instant::now());

        let removed = self.prune_older_than(retention_cutoff(self.config.retention)?)?;
        if removed > 0 {
            log::info!("Pruned {} rows past retention", removed);
        }
        Ok(())
    }

    /// Delete every row with `timestamp < cutoff` in one transaction.
    pub fn prune_older_than(&self, cutoff: Timestamp) -> Result<usize> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let secs = cutoff.timestamp();
        let mut removed = tx.execute(
            "DELETE FROM climate_readings WHERE timestamp < ?1",
            rusqlite::params![secs],
        )?;
        removed += tx.execute(
            "DELETE FROM power_readings WHERE timestamp < ?1",
            rusqlite::params![secs],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    /// Delete all rows of every table and re-apply the schema.
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM climate_readings", [])?;
        tx.execute("DELETE FROM power_readings", [])?;
        tx.commit()?;
        conn.execute_batch(SCHEMA)?;
        log::info!("Store cleared");
        Ok(())
    }

    /// Latest climate sample per sensor.
    ///
    /// With `since`, a sensor's newest sample after `since` wins; sensors
    /// that reported nothing newer fall back to their last row ever
    /// recorded, so every sensor that has reported once stays visible.
    pub fn latest_per_sensor(
        &self,
        since: Option<Timestamp>,
    ) -> Result<BTreeMap<SensorId, Sample>> {
        let conn = self.reader()?;
        let sensors: Vec<String> = {
            let mut stmt = conn.prepare_cached("SELECT DISTINCT sensor_id FROM climate_readings")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut newest_since = conn.prepare_cached(&format!(
            "SELECT {CLIMATE_COLUMNS} FROM climate_readings \
             WHERE sensor_id = ?1 AND timestamp > ?2 \
             ORDER BY timestamp DESC, id DESC LIMIT 1"
        ))?;
        let mut newest_ever = conn.prepare_cached(&format!(
            "SELECT {CLIMATE_COLUMNS} FROM climate_readings \
             WHERE sensor_id = ?1 ORDER BY id DESC LIMIT 1"
        ))?;

        let mut latest = BTreeMap::new();
        for sensor in sensors {
            let fresh = match since {
                Some(since) => newest_since
                    .query_row(rusqlite::params![sensor, since.timestamp()], climate_row)
                    .optional()?,
                None => None,
            };
            let row = match fresh {
                Some(row) => Some(row),
                None => newest_ever
                    .query_row(rusqlite::params![sensor], climate_row)
                    .optional()?,
            };
            if let Some(row) = row {
                latest.insert(row.sample.sensor_id.clone(), row.sample);
            }
        }
        Ok(latest)
    }

    /// Last climate sample written by one sensor.
    pub fn latest_for(&self, sensor_id: &SensorId) -> Result<Option<Sample>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CLIMATE_COLUMNS} FROM climate_readings WHERE sensor_id = ?1 ORDER BY id DESC LIMIT 1"
        ))?;
        let row = stmt
            .query_row(rusqlite::params![sensor_id.as_str()], climate_row)
            .optional()?;
        Ok(row.map(|r| r.sample))
    }

    /// Latest power sample for one meter.
    pub fn latest_power(&self, sensor_id: &SensorId) -> Result<Option<Sample>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POWER_COLUMNS} FROM power_readings WHERE sensor_id = ?1 ORDER BY id DESC LIMIT 1"
        ))?;
        let row = stmt
            .query_row(rusqlite::params![sensor_id.as_str()], power_row)
            .optional()?;
        Ok(row.map(|r| r.sample))
    }

    /// Climate samples with `timestamp >= since`, oldest first, ties by id.
    pub fn range_since(&self, since: Timestamp) -> Result<Vec<Sample>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CLIMATE_COLUMNS} FROM climate_readings \
             WHERE timestamp >= ?1 ORDER BY timestamp ASC, id ASC"
        ))?;
        let rows = stmt.query_map(rusqlite::params![since.timestamp()], climate_row)?;
        let mut samples = Vec::new();
        for row in rows {
            samples.push(row?.sample);
        }
        Ok(samples)
    }

    /// The newest `limit` climate rows, returned oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<ReadingRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CLIMATE_COLUMNS} FROM ( \
                 SELECT {CLIMATE_COLUMNS} FROM climate_readings ORDER BY id DESC LIMIT ?1 \
             ) ORDER BY id ASC"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(rusqlite::params![limit], climate_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Every climate row, ordered by timestamp then id.
    pub fn dump_all(&self) -> Result<Vec<ReadingRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CLIMATE_COLUMNS} FROM climate_readings ORDER BY timestamp ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], climate_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Every power row, ordered by timestamp then id.
    pub fn dump_power(&self) -> Result<Vec<ReadingRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POWER_COLUMNS} FROM power_readings ORDER BY timestamp ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], power_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Number of rows across both tables.
    pub fn row_count(&self) -> Result<u64> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM climate_readings) + (SELECT COUNT(*) FROM power_readings)",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.config.path)
            .field("retention", &self.config.retention)
            .finish_non_exhaustive()
    }
}
