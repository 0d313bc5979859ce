//! Shared fixtures for cleaner tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cleaner::Cleaner;
use crate::log::{Log, LogConfig, LogError, SegmentedLog};
use crate::offset_map::HashAlgorithm;
use crate::segment::Segment;
use crate::throttler::Throttler;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A compacted-log config with small segments so tests roll quickly.
pub fn test_log_config() -> LogConfig {
    LogConfig {
        compact: true,
        min_cleanable_ratio: 0.1,
        segment_size: 4096,
        max_index_size: 4096,
        delete_retention_ms: 60 * 60 * 1000,
        max_message_size: 64 * 1024,
        index_interval_bytes: 256,
    }
}

/// A cleaner with a generously sized map and default load factor.
pub fn test_cleaner() -> Cleaner {
    cleaner_with(1024 * 1024, 0.75, 1024, 64 * 1024)
}

/// A cleaner with explicit map memory, load factor, and buffer limits.
pub fn cleaner_with(
    map_memory: usize,
    load_factor: f64,
    io_buffer_size: usize,
    max_message_size: usize,
) -> Cleaner {
    Cleaner::new(
        0,
        map_memory,
        HashAlgorithm::Sha256,
        load_factor,
        io_buffer_size,
        max_message_size,
        Arc::new(Throttler::unlimited()),
        Arc::new(AtomicBool::new(false)),
    )
}

/// Appends `(key, value)` pairs; `None` values are tombstones.
pub fn append_all(log: &SegmentedLog, entries: &[(&str, Option<&str>)]) {
    for (key, value) in entries {
        log.append(key.as_bytes(), value.map(str::as_bytes)).unwrap();
    }
}

/// The `(offset, key, value)` view of a log, for compact assertions.
pub fn contents(log: &SegmentedLog) -> Vec<(u64, String, Option<String>)> {
    log.read_all()
        .unwrap()
        .into_iter()
        .map(|r| {
            (
                r.offset,
                String::from_utf8(r.key.unwrap_or_default()).unwrap(),
                r.value.map(|v| String::from_utf8(v).unwrap()),
            )
        })
        .collect()
}

/// True when any file under `dir` still carries a staging suffix.
pub fn has_staging_files(dir: &std::path::Path) -> bool {
    std::fs::read_dir(dir).unwrap().any(|entry| {
        let name = entry.unwrap().file_name().to_string_lossy().into_owned();
        name.ends_with(".cleaned") || name.ends_with(".swap")
    })
}

/// A log wrapper that truncates the underlying log right before the first
/// segment swap — a deterministic stand-in for a truncation racing the
/// cleaner.
pub struct TruncateOnSwap {
    pub inner: Arc<SegmentedLog>,
    pub truncate_to: u64,
    fired: AtomicBool,
}

impl TruncateOnSwap {
    pub fn new(inner: Arc<SegmentedLog>, truncate_to: u64) -> Self {
        Self {
            inner,
            truncate_to,
            fired: AtomicBool::new(false),
        }
    }
}

impl Log for TruncateOnSwap {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn dir(&self) -> PathBuf {
        self.inner.dir()
    }

    fn config(&self) -> LogConfig {
        self.inner.config()
    }

    fn active_segment(&self) -> Arc<Segment> {
        self.inner.active_segment()
    }

    fn segments_in_range(&self, from: u64, to: u64) -> Vec<Arc<Segment>> {
        self.inner.segments_in_range(from, to)
    }

    fn truncate_count(&self) -> u32 {
        self.inner.truncate_count()
    }

    fn replace_segments(
        &self,
        new_segment: Arc<Segment>,
        old: &[Arc<Segment>],
        expected_truncate_count: u32,
    ) -> Result<(), LogError> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.inner.truncate_to(self.truncate_to).unwrap();
        }
        self.inner
            .replace_segments(new_segment, old, expected_truncate_count)
    }
}
