//! Filtered segment rewrite — the I/O half of a cleaning run.
//!
//! A group of adjacent source segments is rewritten into one staged
//! destination segment (named after the group's first base offset, with a
//! `.cleaned` suffix). Records are copied **verbatim, frame and all** when
//! they survive filtering, so offsets, timestamps, and checksums are
//! preserved byte-for-byte. A record is dropped when either
//!
//! - the offset map holds a strictly greater offset for its key (a newer
//!   write exists inside the cleaned range), or
//! - it is a tombstone and its source segment has aged past the delete
//!   horizon.
//!
//! The staged segment becomes live through the log's optimistic
//! [`replace_segments`](crate::log::Log::replace_segments) swap; any
//! failure — truncation conflict, I/O fault, cancellation — removes the
//! staged files before the error propagates.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::log::Log;
use crate::offset_map::OffsetMap;
use crate::segment::{CLEANED_FILE_SUFFIX, Record, Segment, decode_frame};

use super::{CleanError, Cleaner, CleanerStats};

impl Cleaner {
    /// Rewrites one group of segments into a staged replacement and swaps
    /// it in.
    pub(crate) fn clean_group(
        &mut self,
        log: &dyn Log,
        sources: &[Arc<Segment>],
        expected_truncate_count: u32,
        delete_horizon_ms: i64,
        stats: &mut CleanerStats,
    ) -> Result<(), CleanError> {
        let Some(first) = sources.first() else {
            return Ok(());
        };
        let config = log.config();
        let dest = Arc::new(Segment::create(
            log.dir(),
            first.base_offset(),
            CLEANED_FILE_SUFFIX,
            config.index_interval_bytes,
            config.max_index_size,
        )?);

        debug!(
            worker = self.id,
            base_offset = first.base_offset(),
            segments = sources.len(),
            "rewriting segment group"
        );

        let result = self
            .filter_into(sources, delete_horizon_ms, &dest, log.name(), stats)
            .and_then(|_| {
                dest.trim_index()?;
                dest.flush()?;
                // Carry the source's age forward so the delete horizon
                // keeps ticking for tombstones that survived this pass.
                dest.set_last_modified_ms(
                    sources.last().map(|s| s.last_modified_ms()).unwrap_or(0),
                );
                log.replace_segments(Arc::clone(&dest), sources, expected_truncate_count)
                    .map_err(CleanError::from)
            });

        if let Err(e) = &result {
            warn!(
                worker = self.id,
                base_offset = first.base_offset(),
                error = %e,
                "rewrite aborted, removing staged files"
            );
            if let Err(delete_err) = dest.delete() {
                warn!(
                    base_offset = first.base_offset(),
                    error = %delete_err,
                    "failed to remove staged segment"
                );
            }
        }
        self.restore_buffers();
        result
    }

    /// Streams every source segment through the filter into `dest`.
    fn filter_into(
        &mut self,
        sources: &[Arc<Segment>],
        delete_horizon_ms: i64,
        dest: &Segment,
        log_name: String,
        stats: &mut CleanerStats,
    ) -> Result<(), CleanError> {
        // One entry per surviving frame: (record offset, position in the
        // write buffer). Lets the destination index every
        // `index_interval_bytes`, matching the source's density.
        let mut frame_bounds: Vec<(u64, u32)> = Vec::new();

        for source in sources {
            let retain_deletes = source.last_modified_ms() > delete_horizon_ms;
            trace!(
                worker = self.id,
                base_offset = source.base_offset(),
                retain_deletes,
                "filtering segment"
            );

            let mut position = 0u64;
            while position < source.size() {
                self.check_cancelled()?;
                let valid = self.fill_read_buffer(source, position, stats)?;
                if valid == 0 {
                    break;
                }

                self.write_buffer.clear();
                frame_bounds.clear();
                let mut consumed = 0usize;
                while let Some((record, frame_len)) =
                    decode_frame(&self.read_buffer[consumed..valid])?
                {
                    stats.messages_read += 1;
                    let key = record.key.as_deref().ok_or_else(|| {
                        CleanError::CorruptRecord(format!(
                            "record at offset {} of compacted log {log_name} has no key",
                            record.offset
                        ))
                    })?;

                    if should_retain(&self.offset_map, key, &record, retain_deletes) {
                        frame_bounds.push((record.offset, self.write_buffer.len() as u32));
                        self.write_buffer
                            .extend_from_slice(&self.read_buffer[consumed..consumed + frame_len]);
                        stats.messages_written += 1;
                    } else {
                        trace!(
                            offset = record.offset,
                            tombstone = record.is_tombstone(),
                            "dropping obsolete record"
                        );
                    }
                    consumed += frame_len;
                }
                position += consumed as u64;

                if !self.write_buffer.is_empty() {
                    dest.append_frames(&self.write_buffer, &frame_bounds)?;
                    self.throttler.maybe_throttle(self.write_buffer.len() as u64);
                    stats.bytes_written += self.write_buffer.len() as u64;
                }
            }
        }
        Ok(())
    }
}

/// Whether `record` survives the clean.
fn should_retain(map: &OffsetMap, key: &[u8], record: &Record, retain_deletes: bool) -> bool {
    if let Some(latest) = map.get(key)
        && latest > record.offset
    {
        return false;
    }
    if record.is_tombstone() && !retain_deletes {
        return false;
    }
    true
}

/// Groups segments for rewrite so that neither the summed message-file
/// size nor the summed index size exceeds its budget.
///
/// Groups are contiguous in offset order. A single segment over budget
/// still forms its own group and is rewritten 1:1.
pub fn group_segments_by_size(
    segments: &[Arc<Segment>],
    max_size: u32,
    max_index_size: u32,
) -> Vec<Vec<Arc<Segment>>> {
    let mut groups = Vec::new();
    let mut current: Vec<Arc<Segment>> = Vec::new();
    let mut bytes = 0u64;
    let mut index_bytes = 0u64;

    for segment in segments {
        let seg_bytes = segment.size();
        let seg_index_bytes = segment.index_size_in_bytes();
        if !current.is_empty()
            && (bytes + seg_bytes > max_size as u64
                || index_bytes + seg_index_bytes > max_index_size as u64)
        {
            groups.push(std::mem::take(&mut current));
            bytes = 0;
            index_bytes = 0;
        }
        current.push(Arc::clone(segment));
        bytes += seg_bytes;
        index_bytes += seg_index_bytes;
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}
