//! Per-log cleaning algorithm.
//!
//! One [`Cleaner`] instance lives on each worker thread and processes one
//! log at a time:
//!
//! 1. Capture the log's truncation counter (the optimistic-concurrency
//!    token for the final swap).
//! 2. **Build the offset map** over the dirty section — every key in
//!    `[first_dirty_offset, active.base_offset)` is hashed into the
//!    worker's [`OffsetMap`] with its latest offset. The scan stops early,
//!    at a segment boundary only, once the map passes its load factor and
//!    further segments cannot advance the cleanable range.
//! 3. Compute the **delete horizon**: tombstones in segments older than
//!    `last_clean_segment.last_modified - delete_retention_ms` are no
//!    longer needed by consumers and may be dropped.
//! 4. **Group** all segments below the map's end offset so that each
//!    rewritten replacement stays within the segment-size and index-size
//!    budgets.
//! 5. Hand each group to the [`rewrite`] module, which filters obsolete
//!    records into a staged `.cleaned` segment and swaps it in.
//!
//! The returned end offset becomes the partition's new first-dirty-offset
//! in the cleaner checkpoint.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Submodules
// ------------------------------------------------------------------------------------------------

pub mod rewrite;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::checkpoint::CheckpointError;
use crate::log::{Log, LogError, TopicPartition};
use crate::offset_map::{HashAlgorithm, OffsetMap, OffsetMapError};
use crate::segment::{FRAME_OVERHEAD, Segment, SegmentError, decode_frame};
use crate::throttler::Throttler;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfacing from a cleaning run.
///
/// None of these escape the worker loop: the manager's workers translate
/// each variant into its recovery behavior — abort the log, release the
/// claim, back off, or exit.
#[derive(Debug, Error)]
pub enum CleanError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Underlying segment failure.
    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    /// The log implementation failed outside the swap conflict.
    #[error("Log error: {0}")]
    Log(LogError),

    /// Checkpoint store failure.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// The offset map refused a new insert. The build loop is required to
    /// stop before the map fills, so this is an engine bug, not an
    /// operational condition.
    #[error("Offset map error: {0}")]
    Map(#[from] OffsetMapError),

    /// The log was truncated between map building and the segment swap.
    /// The run aborts without advancing the checkpoint.
    #[error("Log truncated during clean")]
    TruncatedDuringClean,

    /// A record violated the compacted-log contract (e.g. a null key).
    #[error("Corrupt log: {0}")]
    CorruptRecord(String),

    /// A record frame larger than the buffer growth limit.
    #[error("Record frame at offset {offset} needs {needed} bytes, limit is {limit}")]
    MessageTooLarge {
        /// Position of the offending chunk within the segment.
        offset: u64,
        /// Buffer size that would be needed.
        needed: usize,
        /// Configured growth limit.
        limit: usize,
    },

    /// Shutdown was signalled; the run unwound cooperatively.
    #[error("Cleaning cancelled by shutdown")]
    Cancelled,
}

impl From<LogError> for CleanError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::TruncatedDuringClean { .. } => CleanError::TruncatedDuringClean,
            other => CleanError::Log(other),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// LogToClean
// ------------------------------------------------------------------------------------------------

/// A candidate log with its dirtiness accounting.
#[derive(Clone)]
pub struct LogToClean {
    /// Which partition this is.
    pub partition: TopicPartition,
    /// The log itself.
    pub log: Arc<dyn Log>,
    /// First offset not yet cleaned, from the checkpoint.
    pub first_dirty_offset: u64,
}

impl LogToClean {
    /// Builds the candidate record.
    pub fn new(partition: TopicPartition, log: Arc<dyn Log>, first_dirty_offset: u64) -> Self {
        Self {
            partition,
            log,
            first_dirty_offset,
        }
    }

    /// Bytes already cleaned: segments below the first dirty offset.
    pub fn clean_bytes(&self) -> u64 {
        self.log
            .segments_in_range(0, self.first_dirty_offset)
            .iter()
            .map(|s| s.size())
            .sum()
    }

    /// Bytes awaiting cleaning: segments between the first dirty offset
    /// and the active segment.
    pub fn dirty_bytes(&self) -> u64 {
        let active_base = self.log.active_segment().base_offset();
        self.log
            .segments_in_range(self.first_dirty_offset, active_base)
            .iter()
            .map(|s| s.size())
            .sum()
    }

    /// Clean plus dirty bytes. The active segment never counts.
    pub fn total_bytes(&self) -> u64 {
        self.clean_bytes() + self.dirty_bytes()
    }

    /// Dirty share of the log, in `[0, 1]`. Zero for an empty log.
    pub fn cleanable_ratio(&self) -> f64 {
        let total = self.total_bytes();
        if total == 0 {
            0.0
        } else {
            self.dirty_bytes() as f64 / total as f64
        }
    }
}

// ------------------------------------------------------------------------------------------------
// CleanerStats
// ------------------------------------------------------------------------------------------------

/// Observational counters for one cleaning run.
#[derive(Debug, Default, Clone)]
pub struct CleanerStats {
    /// Bytes read from source segments (map build plus rewrite).
    pub bytes_read: u64,
    /// Records decoded from source segments.
    pub messages_read: u64,
    /// Bytes written to staged segments.
    pub bytes_written: u64,
    /// Records that survived filtering.
    pub messages_written: u64,
    /// Time spent building the offset map.
    pub map_build_duration: Duration,
    /// Wall-clock time of the whole run.
    pub elapsed: Duration,
}

impl CleanerStats {
    /// Fraction of rewritten bytes eliminated by this run.
    pub fn shrinkage(&self) -> f64 {
        if self.bytes_read == 0 {
            0.0
        } else {
            1.0 - self.bytes_written as f64 / self.bytes_read as f64
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Cleaner
// ------------------------------------------------------------------------------------------------

/// Per-worker cleaning state: the offset map, reusable I/O buffers, and
/// handles to the shared throttler and cancellation flag.
pub struct Cleaner {
    id: usize,
    offset_map: OffsetMap,
    load_factor: f64,
    io_buffer_size: usize,
    max_io_buffer_size: usize,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
    throttler: Arc<Throttler>,
    cancel: Arc<AtomicBool>,
}

impl Cleaner {
    /// Creates one worker's cleaner.
    ///
    /// `map_memory_bytes` is this worker's share of the dedupe buffer;
    /// `max_message_size` bounds read-buffer growth.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        map_memory_bytes: usize,
        hash_algorithm: HashAlgorithm,
        load_factor: f64,
        io_buffer_size: usize,
        max_message_size: usize,
        throttler: Arc<Throttler>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        // Halve the I/O budget between the read and write sides.
        let half = (io_buffer_size / 2).max(FRAME_OVERHEAD * 2);
        Self {
            id,
            offset_map: OffsetMap::new(map_memory_bytes, hash_algorithm),
            load_factor,
            io_buffer_size: half,
            max_io_buffer_size: max_message_size + FRAME_OVERHEAD,
            read_buffer: vec![0u8; half],
            write_buffer: Vec::with_capacity(half),
            throttler: Arc::clone(&throttler),
            cancel,
        }
    }

    /// Worker id, for log correlation.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Cleans one log: builds the offset map over the dirty section, then
    /// rewrites every group of segments below the resulting end offset.
    ///
    /// Returns the end offset (the new first-dirty-offset) and the run's
    /// stats. On [`CleanError::TruncatedDuringClean`] the caller records
    /// no progress; staged files have already been removed.
    pub fn clean(&mut self, to_clean: &LogToClean) -> Result<(u64, CleanerStats), CleanError> {
        let start = Instant::now();
        let mut stats = CleanerStats::default();
        let log = &to_clean.log;
        let config = log.config();
        let first_dirty = to_clean.first_dirty_offset;

        let truncate_count = log.truncate_count();
        let active_base = log.active_segment().base_offset();

        info!(
            worker = self.id,
            partition = %to_clean.partition,
            first_dirty,
            active_base,
            "beginning clean"
        );

        // Phase 1: index the dirty section.
        self.offset_map.clear();
        let map_start = Instant::now();
        let max_ingested =
            self.build_offset_map(log.as_ref(), first_dirty, active_base, &mut stats)?;
        stats.map_build_duration = map_start.elapsed();

        let Some(max_ingested) = max_ingested else {
            // Nothing dirty to index; leave the checkpoint where it is.
            debug!(
                worker = self.id,
                partition = %to_clean.partition,
                "dirty section holds no records, nothing to do"
            );
            stats.elapsed = start.elapsed();
            return Ok((first_dirty, stats));
        };
        let end_offset = max_ingested + 1;

        // Phase 2: the delete horizon comes from the newest segment lying
        // entirely below the first dirty offset. Only the last returned
        // segment can straddle the boundary (every earlier one ends where
        // its successor begins); a straddler falls back to its
        // predecessor. No fully-clean segment yet means no tombstone is
        // old enough to drop.
        let clean_segments = log.segments_in_range(0, first_dirty);
        let mut horizon_anchor = None;
        if let Some(last) = clean_segments.last() {
            if last.next_offset()? <= first_dirty {
                horizon_anchor = Some(last);
            } else if clean_segments.len() >= 2 {
                horizon_anchor = clean_segments.get(clean_segments.len() - 2);
            }
        }
        let delete_horizon_ms = horizon_anchor
            .map(|s| s.last_modified_ms() - config.delete_retention_ms as i64)
            .unwrap_or(0);

        debug!(
            worker = self.id,
            partition = %to_clean.partition,
            end_offset,
            delete_horizon_ms,
            map_utilization = self.offset_map.utilization(),
            "offset map built"
        );

        // Phase 3: rewrite everything below the end offset, group by group.
        let segments = log.segments_in_range(0, end_offset);
        let groups =
            rewrite::group_segments_by_size(&segments, config.segment_size, config.max_index_size);
        for group in groups {
            self.check_cancelled()?;
            self.clean_group(
                log.as_ref(),
                &group,
                truncate_count,
                delete_horizon_ms,
                &mut stats,
            )?;
        }

        stats.elapsed = start.elapsed();
        Ok((end_offset, stats))
    }

    /// Scans the dirty section in offset order, feeding every key into the
    /// offset map. Returns the largest offset ingested, or `None` when the
    /// section held no records.
    ///
    /// Ingestion stops early — at a segment boundary only — once both hold:
    /// the next segment's base offset lies past `start + slots × load`
    /// and the map has crossed its load factor.
    fn build_offset_map(
        &mut self,
        log: &dyn Log,
        start: u64,
        end: u64,
        stats: &mut CleanerStats,
    ) -> Result<Option<u64>, CleanError> {
        let mut max_ingested: Option<u64> = None;
        let offset_cap = start + (self.offset_map.slots() as f64 * self.load_factor) as u64;

        for segment in log.segments_in_range(start, end) {
            self.check_cancelled()?;
            if segment.base_offset() > offset_cap
                && self.offset_map.utilization() >= self.load_factor
            {
                debug!(
                    worker = self.id,
                    base_offset = segment.base_offset(),
                    utilization = self.offset_map.utilization(),
                    "offset map reached load factor, stopping build at segment boundary"
                );
                break;
            }

            let mut position = 0u64;
            while position < segment.size() {
                self.check_cancelled()?;
                let valid = self.fill_read_buffer(&segment, position, stats)?;
                if valid == 0 {
                    break;
                }

                let mut consumed = 0usize;
                while let Some((record, frame_len)) =
                    decode_frame(&self.read_buffer[consumed..valid])?
                {
                    stats.messages_read += 1;
                    let key = record.key.as_deref().ok_or_else(|| {
                        CleanError::CorruptRecord(format!(
                            "record at offset {} of compacted log {} has no key",
                            record.offset,
                            log.name()
                        ))
                    })?;
                    self.offset_map.put(key, record.offset)?;
                    max_ingested = Some(max_ingested.map_or(record.offset, |m| m.max(record.offset)));
                    consumed += frame_len;
                }
                position += consumed as u64;
            }
            trace!(
                worker = self.id,
                base_offset = segment.base_offset(),
                utilization = self.offset_map.utilization(),
                "segment ingested into offset map"
            );
        }

        self.restore_buffers();
        Ok(max_ingested)
    }

    /// Reads one chunk at `position`, growing the read buffer (doubling,
    /// up to the limit) until it holds at least one complete frame.
    ///
    /// Returns the number of valid bytes, or 0 at end of segment.
    pub(crate) fn fill_read_buffer(
        &mut self,
        segment: &Segment,
        position: u64,
        stats: &mut CleanerStats,
    ) -> Result<usize, CleanError> {
        loop {
            self.throttler.maybe_throttle(self.read_buffer.len() as u64);
            let n = segment.read_into(&mut self.read_buffer, position)?;
            stats.bytes_read += n as u64;
            if n == 0 {
                return Ok(0);
            }
            if first_frame_len(&self.read_buffer[..n]).is_some_and(|len| len <= n) {
                return Ok(n);
            }
            if n < self.read_buffer.len() {
                // The segment ended inside a frame: torn write.
                return Err(CleanError::CorruptRecord(format!(
                    "partial record frame at position {position} of segment {}",
                    segment.base_offset()
                )));
            }

            let needed = first_frame_len(&self.read_buffer[..n]).unwrap_or(n * 2);
            let grown = (self.read_buffer.len() * 2).max(needed);
            if grown > self.max_io_buffer_size {
                return Err(CleanError::MessageTooLarge {
                    offset: position,
                    needed,
                    limit: self.max_io_buffer_size,
                });
            }
            debug!(
                worker = self.id,
                from = self.read_buffer.len(),
                to = grown,
                "growing read buffer for oversized record"
            );
            self.read_buffer.resize(grown, 0);
        }
    }

    /// Shrinks both buffers back to the configured size so one oversized
    /// record does not bloat steady-state memory.
    pub(crate) fn restore_buffers(&mut self) {
        if self.read_buffer.len() > self.io_buffer_size {
            self.read_buffer.truncate(self.io_buffer_size);
            self.read_buffer.shrink_to_fit();
        }
        if self.write_buffer.capacity() > self.io_buffer_size {
            self.write_buffer = Vec::with_capacity(self.io_buffer_size);
        }
    }

    /// Errors out with [`CleanError::Cancelled`] once shutdown is
    /// signalled. Checked between records and between groups.
    pub(crate) fn check_cancelled(&self) -> Result<(), CleanError> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(CleanError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Length of the first frame in `buf`, if the length prefix is readable.
fn first_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&buf[..4]);
    Some(u32::from_le_bytes(len) as usize + FRAME_OVERHEAD)
}
