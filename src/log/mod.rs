//! The log capability consumed by the compaction engine.
//!
//! The engine never owns partition logs — the hosting broker does. What the
//! engine needs from a log is narrow: enumerate segments, identify the
//! active one, observe the truncation counter, and atomically swap a group
//! of segments for a rewritten replacement. That contract is the [`Log`]
//! trait; the manager reaches logs through a [`LogRegistry`] of weak
//! references, so a partition deleted mid-flight simply stops resolving.
//!
//! [`SegmentedLog`] is a minimal file-backed implementation of the
//! capability — enough to host a compacted partition on disk (append with
//! segment rolling, truncation, the optimistic swap) without any of the
//! broker surface this crate deliberately leaves out.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::segment::{
    CLEANED_FILE_SUFFIX, DELETED_FILE_SUFFIX, LOG_FILE_SUFFIX, Record, Segment, SegmentError,
    SWAP_FILE_SUFFIX,
};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// Underlying segment failure.
    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The optimistic swap found a truncation counter other than the one
    /// captured before map building: the log was truncated mid-clean.
    #[error("Log truncated during clean (expected truncate count {expected}, found {actual})")]
    TruncatedDuringClean {
        /// Counter captured at the start of the clean.
        expected: u32,
        /// Counter observed at swap time.
        actual: u32,
    },
}

// ------------------------------------------------------------------------------------------------
// TopicPartition
// ------------------------------------------------------------------------------------------------

/// Identity of one partitioned log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    topic: String,
    partition: u32,
}

impl TopicPartition {
    /// Creates a topic/partition pair.
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// Topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition id within the topic.
    pub fn partition(&self) -> u32 {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

// ------------------------------------------------------------------------------------------------
// LogConfig
// ------------------------------------------------------------------------------------------------

/// Per-log configuration consulted by the cleaner.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// True when the log uses the compaction retention policy. Only
    /// compacted logs are ever selected for cleaning.
    pub compact: bool,

    /// Minimum dirty/(clean+dirty) ratio before a log is worth cleaning.
    pub min_cleanable_ratio: f64,

    /// Size budget (bytes) for rewritten segment groups, and the roll
    /// threshold for the active segment.
    pub segment_size: u32,

    /// Maximum size (bytes) of one offset index file; also the index-size
    /// budget when grouping segments for rewrite.
    pub max_index_size: u32,

    /// Grace period during which tombstones survive cleaning.
    pub delete_retention_ms: u64,

    /// Largest record the log will accept; also bounds the cleaner's read
    /// buffer growth.
    pub max_message_size: u32,

    /// Bytes of appended data between sparse index entries.
    pub index_interval_bytes: u32,
}

impl LogConfig {
    /// A compacted log with production-shaped defaults.
    pub fn compacted() -> Self {
        Self {
            compact: true,
            min_cleanable_ratio: 0.5,
            segment_size: 1024 * 1024 * 1024,
            max_index_size: 10 * 1024 * 1024,
            delete_retention_ms: 24 * 60 * 60 * 1000,
            max_message_size: 1024 * 1024,
            index_interval_bytes: 4096,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            compact: false,
            ..Self::compacted()
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Log capability
// ------------------------------------------------------------------------------------------------

/// The narrow log interface the compaction engine consumes.
///
/// There is effectively one implementation at runtime (the broker's log);
/// tests substitute [`SegmentedLog`].
pub trait Log: Send + Sync {
    /// Human-readable log name (by convention the directory name).
    fn name(&self) -> String;

    /// Directory holding this log's segment files.
    fn dir(&self) -> PathBuf;

    /// Current configuration.
    fn config(&self) -> LogConfig;

    /// The segment currently receiving appends. Never compacted.
    fn active_segment(&self) -> Arc<Segment>;

    /// Segments whose offset range intersects `[from, to)`, in offset
    /// order — including the segment that contains `from` even when its
    /// base offset lies below it.
    fn segments_in_range(&self, from: u64, to: u64) -> Vec<Arc<Segment>>;

    /// Monotonic counter bumped by every truncation; the cleaner's
    /// optimistic-concurrency token.
    fn truncate_count(&self) -> u32;

    /// Atomically replaces `old` with the staged `new_segment`: verifies
    /// the truncation counter, renames the `.cleaned` files live, splices
    /// the segment list, and schedules deletion of the displaced files.
    fn replace_segments(
        &self,
        new_segment: Arc<Segment>,
        old: &[Arc<Segment>],
        expected_truncate_count: u32,
    ) -> Result<(), LogError>;
}

// ------------------------------------------------------------------------------------------------
// LogRegistry
// ------------------------------------------------------------------------------------------------

/// Shared map of partitions to weak log references.
///
/// The broker registers logs as partitions come and go; the cleaner
/// upgrades on use and treats a dead reference as "nothing to do".
#[derive(Clone, Default)]
pub struct LogRegistry {
    inner: Arc<RwLock<HashMap<TopicPartition, Weak<dyn Log>>>>,
}

impl LogRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the log for `partition`.
    pub fn insert<L: Log + 'static>(&self, partition: TopicPartition, log: &Arc<L>) {
        let as_dyn: Arc<dyn Log> = log.clone();
        self.inner
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(partition, Arc::downgrade(&as_dyn));
    }

    /// Removes the registration for `partition`.
    pub fn remove(&self, partition: &TopicPartition) {
        self.inner
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(partition);
    }

    /// Upgrades the reference for `partition`, if it is still alive.
    pub fn get(&self, partition: &TopicPartition) -> Option<Arc<dyn Log>> {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(partition)
            .and_then(Weak::upgrade)
    }

    /// All currently-live logs. Dead references are pruned as a side
    /// effect.
    pub fn live_logs(&self) -> Vec<(TopicPartition, Arc<dyn Log>)> {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let mut live = Vec::with_capacity(inner.len());
        inner.retain(|partition, weak| match weak.upgrade() {
            Some(log) => {
                live.push((partition.clone(), log));
                true
            }
            None => {
                trace!(%partition, "pruning deleted log from registry");
                false
            }
        });
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live
    }
}

// ------------------------------------------------------------------------------------------------
// SegmentedLog
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct LogInner {
    /// Segments in ascending base-offset order; the last one is active.
    segments: Vec<Arc<Segment>>,
    next_offset: u64,
}

/// Minimal file-backed implementation of the [`Log`] capability.
///
/// Supports append with segment rolling, whole-log reads, truncation
/// (bumping the truncate counter), and the atomic segment swap. Everything
/// broker-shaped — leadership, replication, fetch — is out of scope.
pub struct SegmentedLog {
    dir: PathBuf,
    config: LogConfig,
    inner: Mutex<LogInner>,
    truncates: AtomicU32,
}

impl SegmentedLog {
    /// Opens (or creates) a log rooted at `dir`.
    ///
    /// Leftovers of an interrupted clean are resolved first: `.cleaned`
    /// files (incomplete rewrite) and `.deleted` files (displaced
    /// segments) are removed, while `.swap` files (a rewrite that already
    /// displaced its sources) are recovered by renaming them live.
    pub fn open(dir: impl Into<PathBuf>, config: LogConfig) -> Result<Self, LogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(CLEANED_FILE_SUFFIX) || name.ends_with(DELETED_FILE_SUFFIX) {
                warn!(file = name, "removing stale staging file from interrupted clean");
                fs::remove_file(&path)?;
            } else if let Some(stem) = name.strip_suffix(SWAP_FILE_SUFFIX) {
                // The swap had already displaced its sources; finish it.
                // Renaming over a not-yet-displaced source is the correct
                // end state either way.
                warn!(file = name, "completing interrupted segment swap");
                fs::rename(&path, path.with_file_name(stem))?;
            }
        }

        let mut base_offsets = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(LOG_FILE_SUFFIX)
                && let Ok(base) = stem.parse::<u64>()
            {
                base_offsets.push(base);
            }
        }
        base_offsets.sort_unstable();

        let mut segments: Vec<Arc<Segment>> = Vec::with_capacity(base_offsets.len().max(1));
        for base in &base_offsets {
            let segment = Arc::new(Segment::open(
                &dir,
                *base,
                config.index_interval_bytes,
                config.max_index_size,
            )?);
            // A recovered swap covers the offset range of the sources it
            // replaced; any source segment that survived the crash is now
            // shadowed and must go.
            if let Some(prev) = segments.last()
                && prev.next_offset()? > segment.base_offset()
            {
                warn!(
                    base_offset = segment.base_offset(),
                    "removing segment shadowed by a recovered swap"
                );
                segment.delete()?;
                continue;
            }
            segments.push(segment);
        }
        if segments.is_empty() {
            segments.push(Arc::new(Segment::create(
                &dir,
                0,
                "",
                config.index_interval_bytes,
                config.max_index_size,
            )?));
        }

        let next_offset = segments
            .last()
            .expect("at least one segment")
            .next_offset()?;

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            next_offset,
            "opened log"
        );
        Ok(Self {
            dir,
            config,
            inner: Mutex::new(LogInner {
                segments,
                next_offset,
            }),
            truncates: AtomicU32::new(0),
        })
    }

    /// Appends one record; returns its assigned offset. Rolls the active
    /// segment first when it has reached the configured segment size.
    pub fn append(&self, key: &[u8], value: Option<&[u8]>) -> Result<u64, LogError> {
        let mut inner = self.lock_inner();
        let offset = inner.next_offset;

        if inner.segments.last().expect("active").size() >= self.config.segment_size as u64 {
            Self::roll_locked(&self.dir, &self.config, &mut inner)?;
        }

        let record = Record {
            offset,
            timestamp: now_ms(),
            key: Some(key.to_vec()),
            value: value.map(<[u8]>::to_vec),
        };
        inner.segments.last().expect("active").append(&[record])?;
        inner.next_offset = offset + 1;
        Ok(offset)
    }

    /// Seals the active segment and starts a new one at the next offset.
    pub fn roll(&self) -> Result<(), LogError> {
        let mut inner = self.lock_inner();
        Self::roll_locked(&self.dir, &self.config, &mut inner)
    }

    /// Removes every record with `offset >= target` and bumps the
    /// truncation counter.
    pub fn truncate_to(&self, target: u64) -> Result<(), LogError> {
        let mut inner = self.lock_inner();
        if target >= inner.next_offset {
            return Ok(());
        }

        while inner.segments.len() > 1 {
            let last_base = inner.segments.last().expect("nonempty").base_offset();
            if last_base >= target {
                let removed = inner.segments.pop().expect("nonempty");
                removed.delete()?;
            } else {
                break;
            }
        }
        inner
            .segments
            .last()
            .expect("at least one segment")
            .truncate_from(target)?;

        inner.next_offset = target;
        let count = self.truncates.fetch_add(1, Ordering::AcqRel) + 1;
        info!(dir = %self.dir.display(), target, truncate_count = count, "truncated log");
        Ok(())
    }

    /// Every record currently in the log, in offset order. Test and
    /// inspection convenience.
    pub fn read_all(&self) -> Result<Vec<Record>, LogError> {
        let inner = self.lock_inner();
        let mut out = Vec::new();
        for segment in &inner.segments {
            out.extend(segment.records()?);
        }
        Ok(out)
    }

    /// Offset that the next append would receive.
    pub fn next_offset(&self) -> u64 {
        self.lock_inner().next_offset
    }

    /// Number of segments, the active one included.
    pub fn segment_count(&self) -> usize {
        self.lock_inner().segments.len()
    }

    fn roll_locked(
        dir: &Path,
        config: &LogConfig,
        inner: &mut LogInner,
    ) -> Result<(), LogError> {
        let active = inner.segments.last().expect("active");
        active.trim_index()?;
        active.flush()?;
        let new_segment = Arc::new(Segment::create(
            dir,
            inner.next_offset,
            "",
            config.index_interval_bytes,
            config.max_index_size,
        )?);
        debug!(
            dir = %dir.display(),
            base_offset = inner.next_offset,
            "rolled new active segment"
        );
        inner.segments.push(new_segment);
        Ok(())
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Log for SegmentedLog {
    fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dir.display().to_string())
    }

    fn dir(&self) -> PathBuf {
        self.dir.clone()
    }

    fn config(&self) -> LogConfig {
        self.config.clone()
    }

    fn active_segment(&self) -> Arc<Segment> {
        Arc::clone(self.lock_inner().segments.last().expect("active"))
    }

    fn segments_in_range(&self, from: u64, to: u64) -> Vec<Arc<Segment>> {
        let inner = self.lock_inner();
        let mut out = Vec::new();
        for (i, segment) in inner.segments.iter().enumerate() {
            if segment.base_offset() >= to {
                break;
            }
            // The segment's records run up to the next segment's base, so
            // it intersects [from, to) unless it ends at or below `from`.
            let upper = inner
                .segments
                .get(i + 1)
                .map(|next| next.base_offset())
                .unwrap_or(u64::MAX);
            if upper > from {
                out.push(Arc::clone(segment));
            }
        }
        out
    }

    fn truncate_count(&self) -> u32 {
        self.truncates.load(Ordering::Acquire)
    }

    fn replace_segments(
        &self,
        new_segment: Arc<Segment>,
        old: &[Arc<Segment>],
        expected_truncate_count: u32,
    ) -> Result<(), LogError> {
        let mut inner = self.lock_inner();

        let actual = self.truncates.load(Ordering::Acquire);
        if actual != expected_truncate_count {
            return Err(LogError::TruncatedDuringClean {
                expected: expected_truncate_count,
                actual,
            });
        }

        // Stage the rename in two steps so a crash between them leaves
        // either the old files or a recoverable `.swap` pair, never both
        // names pointing at live data.
        new_segment.change_suffix(CLEANED_FILE_SUFFIX, SWAP_FILE_SUFFIX)?;

        let old_bases: Vec<u64> = old.iter().map(|s| s.base_offset()).collect();
        let mut displaced = Vec::with_capacity(old.len());
        inner.segments.retain(|segment| {
            if old_bases.contains(&segment.base_offset()) {
                displaced.push(Arc::clone(segment));
                false
            } else {
                true
            }
        });

        for segment in &displaced {
            segment.change_suffix("", DELETED_FILE_SUFFIX)?;
        }

        new_segment.change_suffix(SWAP_FILE_SUFFIX, "")?;
        let insert_at = inner
            .segments
            .partition_point(|s| s.base_offset() < new_segment.base_offset());
        inner.segments.insert(insert_at, Arc::clone(&new_segment));

        info!(
            dir = %self.dir.display(),
            base_offset = new_segment.base_offset(),
            replaced = displaced.len(),
            "swapped in rewritten segment"
        );

        // The displaced files already carry the `.deleted` suffix and are
        // invisible to recovery; unlink them off the swap path.
        std::thread::spawn(move || {
            for segment in displaced {
                if let Err(e) = segment.delete() {
                    warn!(base_offset = segment.base_offset(), error = %e, "failed to delete displaced segment");
                }
            }
        });

        Ok(())
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
