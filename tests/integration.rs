//! Integration tests for the public compaction-engine API.
//!
//! These tests exercise the full stack (segments → logs → cleaner →
//! manager) through the public `emberlog` surface only. No internal
//! modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: manager construction, startup, shutdown
//! - **Compaction**: last-write-wins across partitions, tombstone
//!   handling, offset preservation
//! - **Durability**: checkpoints and compacted contents survive reopen
//! - **Concurrency**: appends racing the cleaner; multiple workers over
//!   multiple partitions
//!
//! ## See also
//! - `cleaner::tests` — scenario-level unit tests of the algorithm
//! - `manager::tests` — selection and lifecycle unit tests

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use emberlog::log::{Log, LogConfig, LogRegistry, SegmentedLog, TopicPartition};
use emberlog::manager::{CleanerConfig, CleanerManager};
use emberlog::offset_map::HashAlgorithm;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn log_config() -> LogConfig {
    LogConfig {
        compact: true,
        min_cleanable_ratio: 0.1,
        segment_size: 2048,
        max_index_size: 4096,
        delete_retention_ms: 60 * 60 * 1000,
        max_message_size: 64 * 1024,
        index_interval_bytes: 256,
    }
}

fn cleaner_config() -> CleanerConfig {
    CleanerConfig {
        num_threads: 2,
        dedupe_buffer_size: 2 * 1024 * 1024,
        back_off_ms: 50,
        hash_algorithm: HashAlgorithm::Sha256,
        ..CleanerConfig::default()
    }
}

fn open_log(data_dir: &TempDir, tp: &TopicPartition) -> Arc<SegmentedLog> {
    Arc::new(SegmentedLog::open(data_dir.path().join(tp.to_string()), log_config()).unwrap())
}

/// Latest value per key among the log's records.
fn latest_per_key(log: &SegmentedLog) -> HashMap<Vec<u8>, Option<Vec<u8>>> {
    let mut latest = HashMap::new();
    for record in log.read_all().unwrap() {
        latest.insert(record.key.clone().unwrap(), record.value.clone());
    }
    latest
}

// ------------------------------------------------------------------------------------------------
// End-to-end compaction
// ------------------------------------------------------------------------------------------------

/// Many update rounds over a small key space must collapse to one record
/// per key (below the active segment), each carrying the final value at
/// its original offset.
#[test]
fn compaction_collapses_history_to_latest_values() {
    init_tracing();
    let data_dir = TempDir::new().unwrap();
    let registry = LogRegistry::new();
    let tp = TopicPartition::new("accounts", 0);
    let log = open_log(&data_dir, &tp);

    let rounds = 8u32;
    let keys = 25u32;
    for round in 0..rounds {
        for key in 0..keys {
            log.append(
                format!("account-{key:04}").as_bytes(),
                Some(format!("balance-{round}-{key}").as_bytes()),
            )
            .unwrap();
        }
    }
    log.roll().unwrap();
    registry.insert(tp.clone(), &log);

    let manager = CleanerManager::new(
        cleaner_config(),
        vec![PathBuf::from(data_dir.path())],
        registry.clone(),
    )
    .unwrap();
    manager.startup();

    let boundary = log.active_segment().base_offset();
    assert!(
        manager.await_cleaned(&tp, boundary, Duration::from_secs(30)),
        "compaction did not finish in time"
    );
    manager.shutdown();

    let records = log.read_all().unwrap();
    let offsets: Vec<u64> = records.iter().map(|r| r.offset).collect();
    assert!(
        offsets.windows(2).all(|w| w[0] < w[1]),
        "offsets must stay strictly increasing: {offsets:?}"
    );

    let mut seen = HashMap::new();
    for record in &records {
        if record.offset >= boundary {
            continue;
        }
        let key = record.key.clone().unwrap();
        assert!(
            seen.insert(key.clone(), record.offset).is_none(),
            "key {:?} appears twice below the cleaning boundary",
            String::from_utf8_lossy(&key)
        );
        let expected = format!(
            "balance-{}-{}",
            rounds - 1,
            String::from_utf8_lossy(&key).trim_start_matches("account-").parse::<u32>().unwrap()
        );
        assert_eq!(record.value.as_deref(), Some(expected.as_bytes()));
    }
    assert_eq!(seen.len(), keys as usize);
}

/// Deleted keys stay deleted: the tombstone is the surviving record for
/// its key while inside the grace period.
#[test]
fn tombstones_suppress_deleted_keys() {
    init_tracing();
    let data_dir = TempDir::new().unwrap();
    let registry = LogRegistry::new();
    let tp = TopicPartition::new("sessions", 0);
    let log = open_log(&data_dir, &tp);

    for i in 0..30u32 {
        log.append(format!("session-{i:03}").as_bytes(), Some(b"open"))
            .unwrap();
    }
    // Close the even sessions.
    for i in (0..30u32).step_by(2) {
        log.append(format!("session-{i:03}").as_bytes(), None).unwrap();
    }
    log.roll().unwrap();
    registry.insert(tp.clone(), &log);

    let manager = CleanerManager::new(
        cleaner_config(),
        vec![PathBuf::from(data_dir.path())],
        registry.clone(),
    )
    .unwrap();
    manager.startup();
    let boundary = log.active_segment().base_offset();
    assert!(manager.await_cleaned(&tp, boundary, Duration::from_secs(30)));
    manager.shutdown();

    let latest = latest_per_key(&log);
    for i in 0..30u32 {
        let key = format!("session-{i:03}").into_bytes();
        let value = latest.get(&key).unwrap_or_else(|| {
            panic!("session {i} vanished entirely — tombstone dropped too early")
        });
        if i % 2 == 0 {
            assert_eq!(value, &None, "session {i} should be a tombstone");
        } else {
            assert_eq!(value.as_deref(), Some(b"open" as &[u8]));
        }
    }
}

/// Compacted state must survive a full process "restart": logs and
/// checkpoints reopened from disk continue where they left off.
#[test]
fn compacted_state_survives_reopen() {
    init_tracing();
    let data_dir = TempDir::new().unwrap();
    let tp = TopicPartition::new("inventory", 0);

    let expected_latest = {
        let registry = LogRegistry::new();
        let log = open_log(&data_dir, &tp);
        for round in 0..5u32 {
            for key in 0..10u32 {
                log.append(
                    format!("item-{key}").as_bytes(),
                    Some(format!("count-{round}").as_bytes()),
                )
                .unwrap();
            }
        }
        log.roll().unwrap();
        registry.insert(tp.clone(), &log);

        let manager = CleanerManager::new(
            cleaner_config(),
            vec![PathBuf::from(data_dir.path())],
            registry.clone(),
        )
        .unwrap();
        manager.startup();
        let boundary = log.active_segment().base_offset();
        assert!(manager.await_cleaned(&tp, boundary, Duration::from_secs(30)));
        manager.shutdown();
        latest_per_key(&log)
    };

    // "Restart": reopen everything from disk.
    let registry = LogRegistry::new();
    let log = open_log(&data_dir, &tp);
    registry.insert(tp.clone(), &log);
    assert_eq!(latest_per_key(&log), expected_latest);

    // A fresh manager sees the stored checkpoint: with no new dirt, the
    // log is not cleanable.
    let manager = CleanerManager::new(
        cleaner_config(),
        vec![PathBuf::from(data_dir.path())],
        registry,
    )
    .unwrap();
    assert!(manager.coordinator().select_dirtiest().is_none());
}

/// Appends racing the cleaner never lose data: every key's final value
/// is the last one appended, whether or not its segment was rewritten.
#[test]
fn appends_race_the_cleaner_safely() {
    init_tracing();
    let data_dir = TempDir::new().unwrap();
    let registry = LogRegistry::new();
    let tp = TopicPartition::new("telemetry", 0);
    let log = open_log(&data_dir, &tp);
    registry.insert(tp.clone(), &log);

    let manager = CleanerManager::new(
        cleaner_config(),
        vec![PathBuf::from(data_dir.path())],
        registry.clone(),
    )
    .unwrap();
    manager.startup();

    let writer_log = Arc::clone(&log);
    let writer = std::thread::spawn(move || {
        for round in 0..20u32 {
            for key in 0..15u32 {
                writer_log
                    .append(
                        format!("metric-{key:02}").as_bytes(),
                        Some(format!("sample-{round}").as_bytes()),
                    )
                    .unwrap();
            }
            if round % 4 == 3 {
                writer_log.roll().unwrap();
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    });
    writer.join().unwrap();

    let boundary = log.active_segment().base_offset();
    assert!(manager.await_cleaned(&tp, boundary, Duration::from_secs(30)));
    manager.shutdown();

    let latest = latest_per_key(&log);
    for key in 0..15u32 {
        let key_bytes = format!("metric-{key:02}").into_bytes();
        assert_eq!(
            latest[&key_bytes].as_deref(),
            Some(b"sample-19" as &[u8]),
            "metric {key} lost its final sample"
        );
    }
}
