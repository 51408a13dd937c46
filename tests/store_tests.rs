//! Store integration tests
//!
//! Covers the persistence guarantees the dashboard relies on: no empty rows,
//! retention pruning, latest-value fallback, clearing, and concurrent use
//! from several threads.

use std::sync::Arc;
use std::thread;

use growbox::sample::{self, from_unix};
use growbox::{PowerReading, Sample, SensorId, Store, StoreConfig, Timestamp};
use rand::Rng;
use tempfile::TempDir;

fn open_store() -> (TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(StoreConfig::with_path(dir.path().join("readings.db"))).unwrap();
    (dir, store)
}

fn ts(secs: i64) -> Timestamp {
    from_unix(secs).unwrap()
}

// ============================================================================
// No empty rows
// ============================================================================

#[test]
fn test_all_null_samples_never_persisted() {
    let (_dir, store) = open_store();

    let empty = [
        Sample::climate("s1", ts(100), None, None),
        Sample::climate("s1", ts(101), Some(f64::NAN), None),
        Sample::climate("s2", ts(102), None, Some(f64::INFINITY)),
        Sample::power("meter", ts(103), PowerReading::default()),
    ];
    for sample in &empty {
        assert_eq!(store.append(sample).unwrap(), None);
    }

    assert_eq!(store.row_count().unwrap(), 0);
    assert!(store.dump_all().unwrap().is_empty());
    assert!(store.dump_power().unwrap().is_empty());
    assert!(store.latest_per_sensor(None).unwrap().is_empty());
}

#[test]
fn test_partial_samples_persisted() {
    let (_dir, store) = open_store();
    store
        .append(&Sample::climate("s1", ts(100), Some(22.0), None))
        .unwrap();
    store
        .append(&Sample::climate("s1", ts(160), None, Some(60.0)))
        .unwrap();
    assert_eq!(store.row_count().unwrap(), 2);
}

// ============================================================================
// Retention
// ============================================================================

#[test]
fn test_prune_removes_only_older_rows() {
    let (_dir, store) = open_store();
    let mut rng = rand::thread_rng();

    for i in 0..200 {
        let secs = rng.gen_range(0..10_000);
        store
            .append(&Sample::climate(
                format!("s{}", i % 3),
                ts(secs),
                Some(20.0 + i as f64 * 0.01),
                None,
            ))
            .unwrap();
    }
    let before = store.dump_all().unwrap();
    let cutoff = ts(5_000);
    let expected_kept: Vec<_> = before
        .iter()
        .filter(|r| r.sample.timestamp >= cutoff)
        .cloned()
        .collect();

    let removed = store.prune_older_than(cutoff).unwrap();

    let after = store.dump_all().unwrap();
    assert_eq!(removed, before.len() - expected_kept.len());
    assert!(after.iter().all(|r| r.sample.timestamp >= cutoff));
    assert_eq!(after, expected_kept);
}

#[test]
fn test_prune_boundary_is_exclusive() {
    let (_dir, store) = open_store();
    store.append(&Sample::climate("s", ts(999), Some(1.0), None)).unwrap();
    store.append(&Sample::climate("s", ts(1_000), Some(2.0), None)).unwrap();
    store
        .append(&Sample::power(
            "meter",
            ts(999),
            PowerReading {
                apower: Some(10.0),
                ..Default::default()
            },
        ))
        .unwrap();

    assert_eq!(store.prune_older_than(ts(1_000)).unwrap(), 2);

    let rows = store.dump_all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].sample.timestamp, ts(1_000));
    assert!(store.dump_power().unwrap().is_empty());
}

// ============================================================================
// Latest value per sensor
// ============================================================================

#[test]
fn test_latest_falls_back_to_last_known_value() {
    let (_dir, store) = open_store();
    let since = ts(10_000);

    store.append(&Sample::climate("a", ts(1_000), Some(18.0), Some(40.0))).unwrap();
    store.append(&Sample::climate("b", ts(9_000), Some(19.0), Some(45.0))).unwrap();
    store.append(&Sample::climate("b", ts(11_000), Some(21.0), Some(50.0))).unwrap();

    let latest = store.latest_per_sensor(Some(since)).unwrap();
    assert_eq!(latest.len(), 2);

    let a = &latest[&SensorId::new("a")];
    assert_eq!(a.timestamp, ts(1_000));
    assert_eq!(a.temperature(), Some(18.0));

    let b = &latest[&SensorId::new("b")];
    assert_eq!(b.timestamp, ts(11_000));
    assert_eq!(b.temperature(), Some(21.0));
}

#[test]
fn test_latest_prefers_newest_timestamp_after_since() {
    let (_dir, store) = open_store();

    // Clock stepped backwards between the two writes
    store.append(&Sample::climate("a", ts(5_000), Some(1.0), None)).unwrap();
    store.append(&Sample::climate("a", ts(4_000), Some(2.0), None)).unwrap();

    let with_since = store.latest_per_sensor(Some(ts(3_000))).unwrap();
    assert_eq!(with_since[&SensorId::new("a")].temperature(), Some(1.0));

    // Without `since`, the last row written wins
    let without = store.latest_per_sensor(None).unwrap();
    assert_eq!(without[&SensorId::new("a")].temperature(), Some(2.0));
}

#[test]
fn test_latest_on_same_timestamp_uses_last_write() {
    let (_dir, store) = open_store();
    store.append(&Sample::climate("a", ts(100), Some(1.0), None)).unwrap();
    store.append(&Sample::climate("a", ts(100), Some(2.0), None)).unwrap();

    let latest = store.latest_per_sensor(Some(ts(50))).unwrap();
    assert_eq!(latest[&SensorId::new("a")].temperature(), Some(2.0));
}

#[test]
fn test_latest_for_single_sensor() {
    let (_dir, store) = open_store();
    store.append(&Sample::climate("a", ts(100), Some(18.0), Some(40.0))).unwrap();
    store.append(&Sample::climate("a", ts(200), Some(18.5), None)).unwrap();
    store.append(&Sample::climate("b", ts(300), Some(25.0), Some(60.0))).unwrap();

    let a = store.latest_for(&SensorId::new("a")).unwrap().unwrap();
    assert_eq!(a.timestamp, ts(200));
    assert_eq!(a.temperature(), Some(18.5));
    assert_eq!(a.humidity(), None);

    assert!(store.latest_for(&SensorId::new("missing")).unwrap().is_none());
}

// ============================================================================
// Clear and dump
// ============================================================================

#[test]
fn test_clear_empties_everything() {
    let (_dir, store) = open_store();
    for i in 0..20 {
        store
            .append(&Sample::climate("s", ts(i * 60), Some(20.0), Some(50.0)))
            .unwrap();
    }
    store
        .append(&Sample::power(
            "meter",
            ts(0),
            PowerReading {
                apower: Some(5.0),
                ..Default::default()
            },
        ))
        .unwrap();

    store.clear().unwrap();

    assert!(store.dump_all().unwrap().is_empty());
    assert!(store.dump_power().unwrap().is_empty());
    assert!(store.latest_per_sensor(None).unwrap().is_empty());

    // Still writable afterwards
    let id = store
        .append(&Sample::climate("s", sample::now(), Some(22.0), None))
        .unwrap();
    assert!(id.is_some());
}

#[test]
fn test_dump_all_ordered_by_timestamp() {
    let (_dir, store) = open_store();
    for secs in [300, 100, 200, 100] {
        store
            .append(&Sample::climate("s", ts(secs), Some(secs as f64), None))
            .unwrap();
    }
    let rows = store.dump_all().unwrap();
    let times: Vec<i64> = rows.iter().map(|r| r.sample.timestamp.timestamp()).collect();
    assert_eq!(times, vec![100, 100, 200, 300]);
    assert!(rows[0].id < rows[1].id);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_writers_and_readers() {
    let (_dir, store) = open_store();
    let store = Arc::new(store);

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..50 {
                    store
                        .append(&Sample::climate(
                            format!("w{}", w),
                            ts(i * 60),
                            Some(i as f64),
                            None,
                        ))
                        .unwrap();
                }
            })
        })
        .collect();

    let reader = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for _ in 0..50 {
                store.latest_per_sensor(None).unwrap();
                store.range_since(ts(0)).unwrap();
            }
        })
    };

    for handle in writers {
        handle.join().unwrap();
    }
    reader.join().unwrap();

    assert_eq!(store.row_count().unwrap(), 200);
    let latest = store.latest_per_sensor(None).unwrap();
    assert_eq!(latest.len(), 4);
    for sample in latest.values() {
        assert_eq!(sample.temperature(), Some(49.0));
    }
}
