//! On-disk segment pair: CRC-framed message file plus sparse offset index.
//!
//! A log is an ordered sequence of segments, each named by its
//! `base_offset` — the offset of its first record. Exactly one segment per
//! log is *active* (receives appends); the rest are immutable. The cleaner
//! reads immutable segments with chunked random-access reads and stages
//! replacement segments under a `.cleaned` suffix, which the log swaps in
//! atomically by renaming.
//!
//! # Files
//!
//! ```text
//! 00000000000000000000.log      <- record frames (see records module)
//! 00000000000000000000.index    <- sparse offset index (see index module)
//! 00000000000000000017.log.cleaned   <- staged rewrite, not yet live
//! ```
//!
//! # Concurrency
//!
//! Appends serialize on an internal mutex; reads go straight to the file
//! descriptor via positional reads and never contend with appends. The
//! cleaner only ever appends to segments it exclusively owns (staged
//! `.cleaned` segments), and only ever reads immutable ones.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Submodules
// ------------------------------------------------------------------------------------------------

pub mod index;
pub mod records;

pub use index::OffsetIndex;
pub use records::{FRAME_OVERHEAD, Record, decode_all, decode_frame, encode_frame};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, trace, warn};

/// Suffix of the message file.
pub const LOG_FILE_SUFFIX: &str = ".log";

/// Suffix of the offset index file.
pub const INDEX_FILE_SUFFIX: &str = ".index";

/// Extra suffix carried by staged rewrite output until the swap.
pub const CLEANED_FILE_SUFFIX: &str = ".cleaned";

/// Extra suffix carried while a staged segment is being swapped in.
pub const SWAP_FILE_SUFFIX: &str = ".swap";

/// Extra suffix carried by displaced segments awaiting deletion.
pub const DELETED_FILE_SUFFIX: &str = ".deleted";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment operations.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record serialization failure.
    #[error("Serialization (encode) error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Record deserialization failure.
    #[error("Deserialization (decode) error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// A record frame failed its CRC32 check.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Structural invariant violation in segment or index data.
    #[error("Corrupt segment: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// Segment
// ------------------------------------------------------------------------------------------------

/// File names for a segment's pair, derived from its base offset.
pub fn log_file_name(base_offset: u64, suffix: &str) -> String {
    format!("{base_offset:020}{LOG_FILE_SUFFIX}{suffix}")
}

/// See [`log_file_name`].
pub fn index_file_name(base_offset: u64, suffix: &str) -> String {
    format!("{base_offset:020}{INDEX_FILE_SUFFIX}{suffix}")
}

#[derive(Debug)]
struct SegmentState {
    log_path: PathBuf,
    index: OffsetIndex,
    /// Message-file bytes accumulated since the last index entry.
    bytes_since_index_entry: u32,
}

/// One segment of a log: message file plus offset index.
#[derive(Debug)]
pub struct Segment {
    base_offset: u64,
    index_interval_bytes: u32,
    file: File,
    state: Mutex<SegmentState>,
    size: AtomicU64,
    last_modified_ms: AtomicI64,
}

impl Segment {
    /// Creates a fresh segment pair in `dir`, replacing any stale files
    /// with the same names (e.g. leftovers of an aborted rewrite).
    pub fn create(
        dir: impl AsRef<Path>,
        base_offset: u64,
        suffix: &str,
        index_interval_bytes: u32,
        max_index_size: u32,
    ) -> Result<Self, SegmentError> {
        let dir = dir.as_ref();
        let log_path = dir.join(log_file_name(base_offset, suffix));
        let index_path = dir.join(index_file_name(base_offset, suffix));

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
        let index = OffsetIndex::create(index_path, base_offset, max_index_size)?;

        trace!(base_offset, path = %log_path.display(), "created segment");
        Ok(Self {
            base_offset,
            index_interval_bytes,
            file,
            state: Mutex::new(SegmentState {
                log_path,
                index,
                bytes_since_index_entry: 0,
            }),
            size: AtomicU64::new(0),
            last_modified_ms: AtomicI64::new(now_ms()),
        })
    }

    /// Opens an existing segment pair. A missing index file is rebuilt by
    /// scanning the message file.
    pub fn open(
        dir: impl AsRef<Path>,
        base_offset: u64,
        index_interval_bytes: u32,
        max_index_size: u32,
    ) -> Result<Self, SegmentError> {
        let dir = dir.as_ref();
        let log_path = dir.join(log_file_name(base_offset, ""));
        let index_path = dir.join(index_file_name(base_offset, ""));

        let file = OpenOptions::new().read(true).write(true).open(&log_path)?;
        let metadata = file.metadata()?;
        let size = metadata.len();
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or_else(now_ms);

        let index = if index_path.exists() {
            OffsetIndex::open(&index_path, base_offset)?
        } else {
            warn!(base_offset, "index file missing, rebuilding from message file");
            let mut index = OffsetIndex::create(&index_path, base_offset, max_index_size)?;
            let mut bytes = vec![0u8; size as usize];
            file.read_exact_at(&mut bytes, 0)?;
            let mut pos = 0usize;
            let mut since_entry = 0u32;
            while let Some((record, frame_len)) = decode_frame(&bytes[pos..])? {
                if since_entry >= index_interval_bytes {
                    index.append(record.offset, pos as u32)?;
                    since_entry = 0;
                }
                since_entry += frame_len as u32;
                pos += frame_len;
            }
            index
        };

        Ok(Self {
            base_offset,
            index_interval_bytes,
            file,
            state: Mutex::new(SegmentState {
                log_path,
                index,
                bytes_since_index_entry: 0,
            }),
            size: AtomicU64::new(size),
            last_modified_ms: AtomicI64::new(last_modified),
        })
    }

    /// Offset of the first record this segment may hold.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Bytes in the message file.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Wall-clock of the last mutation, milliseconds since the epoch.
    pub fn last_modified_ms(&self) -> i64 {
        self.last_modified_ms.load(Ordering::Acquire)
    }

    /// Overrides the recorded modification time. The rewriter stamps the
    /// destination segment with the source's age so that tombstone grace
    /// periods survive a rewrite.
    pub fn set_last_modified_ms(&self, ms: i64) {
        self.last_modified_ms.store(ms, Ordering::Release);
    }

    /// Bytes of valid index data.
    pub fn index_size_in_bytes(&self) -> u64 {
        let state = self.lock_state();
        state.index.size_in_bytes()
    }

    /// Current path of the message file.
    pub fn log_path(&self) -> PathBuf {
        self.lock_state().log_path.clone()
    }

    /// Current path of the index file.
    pub fn index_path(&self) -> PathBuf {
        self.lock_state().index.path().to_path_buf()
    }

    /// Appends records, encoding one frame per record and populating the
    /// index every `index_interval_bytes`.
    pub fn append(&self, records: &[Record]) -> Result<u64, SegmentError> {
        let mut state = self.lock_state();
        let mut buf = Vec::new();
        let start_size = self.size.load(Ordering::Acquire);

        for record in records {
            if state.bytes_since_index_entry >= self.index_interval_bytes {
                let position = start_size + buf.len() as u64;
                state.index.append(record.offset, position as u32)?;
                state.bytes_since_index_entry = 0;
            }
            let frame_len = encode_frame(record, &mut buf)?;
            state.bytes_since_index_entry += frame_len as u32;
        }

        self.file.write_all_at(&buf, start_size)?;
        self.size
            .store(start_size + buf.len() as u64, Ordering::Release);
        self.last_modified_ms.store(now_ms(), Ordering::Release);
        Ok(buf.len() as u64)
    }

    /// Appends pre-encoded frames verbatim in one write. `bounds` lists
    /// each frame's record offset and byte position within `frames`, in
    /// order, so the index keeps its per-`index_interval_bytes` density
    /// across bulk appends exactly as [`Segment::append`] would.
    pub fn append_frames(&self, frames: &[u8], bounds: &[(u64, u32)]) -> Result<(), SegmentError> {
        if frames.is_empty() {
            return Ok(());
        }
        let mut state = self.lock_state();
        let start_size = self.size.load(Ordering::Acquire);

        for (i, (offset, rel_pos)) in bounds.iter().enumerate() {
            if state.bytes_since_index_entry >= self.index_interval_bytes {
                state
                    .index
                    .append(*offset, (start_size + *rel_pos as u64) as u32)?;
                state.bytes_since_index_entry = 0;
            }
            let frame_end = bounds
                .get(i + 1)
                .map(|(_, next_pos)| *next_pos as usize)
                .unwrap_or(frames.len());
            state.bytes_since_index_entry = state
                .bytes_since_index_entry
                .saturating_add((frame_end - *rel_pos as usize) as u32);
        }

        self.file.write_all_at(frames, start_size)?;
        self.size
            .store(start_size + frames.len() as u64, Ordering::Release);
        self.last_modified_ms.store(now_ms(), Ordering::Release);
        Ok(())
    }

    /// Positional read into `buf` starting at `position`; returns the
    /// bytes read (0 at end of segment).
    pub fn read_into(&self, buf: &mut [u8], position: u64) -> Result<usize, SegmentError> {
        let size = self.size();
        if position >= size {
            return Ok(0);
        }
        let want = buf.len().min((size - position) as usize);
        let mut filled = 0usize;
        while filled < want {
            let n = self.file.read_at(&mut buf[filled..want], position + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Decodes every record in the segment. Intended for log reads and
    /// tests; the cleaner uses chunked [`Segment::read_into`] instead.
    pub fn records(&self) -> Result<Vec<Record>, SegmentError> {
        let size = self.size() as usize;
        let mut bytes = vec![0u8; size];
        let n = self.read_into(&mut bytes, 0)?;
        decode_all(&bytes[..n])
    }

    /// Greatest indexed `(offset, position)` at or below `target`.
    pub fn lookup(&self, target: u64) -> (u64, u32) {
        self.lock_state().index.lookup(target)
    }

    /// Offset one past the last record, or the base offset when empty.
    pub fn next_offset(&self) -> Result<u64, SegmentError> {
        Ok(self
            .records()?
            .last()
            .map(|r| r.offset + 1)
            .unwrap_or(self.base_offset))
    }

    /// Drops every record with `offset >= target`; returns bytes removed.
    pub fn truncate_from(&self, target: u64) -> Result<u64, SegmentError> {
        let mut state = self.lock_state();
        let size = self.size() as usize;
        let mut bytes = vec![0u8; size];
        self.file.read_exact_at(&mut bytes, 0)?;

        let mut cut = size;
        let mut pos = 0usize;
        while let Some((record, frame_len)) = decode_frame(&bytes[pos..])? {
            if record.offset >= target {
                cut = pos;
                break;
            }
            pos += frame_len;
        }

        if cut < size {
            self.file.set_len(cut as u64)?;
            self.size.store(cut as u64, Ordering::Release);
            state.index.truncate_to(target);
            state.bytes_since_index_entry = 0;
            self.last_modified_ms.store(now_ms(), Ordering::Release);
            debug!(
                base_offset = self.base_offset,
                target,
                removed = size - cut,
                "truncated segment"
            );
        }
        Ok((size - cut) as u64)
    }

    /// Shrinks the index file to its valid size.
    pub fn trim_index(&self) -> Result<(), SegmentError> {
        self.lock_state().index.trim_to_valid_size()
    }

    /// Fsyncs the message file and flushes the index.
    pub fn flush(&self) -> Result<(), SegmentError> {
        self.file.sync_all()?;
        self.lock_state().index.flush()
    }

    /// Renames both files, replacing the trailing `from` suffix with `to`
    /// (either may be empty). The open descriptors stay valid across the
    /// rename.
    pub fn change_suffix(&self, from: &str, to: &str) -> Result<(), SegmentError> {
        let mut state = self.lock_state();

        let new_log = swap_suffix(&state.log_path, from, to)?;
        fs::rename(&state.log_path, &new_log)?;
        state.log_path = new_log;

        let new_index = swap_suffix(state.index.path(), from, to)?;
        fs::rename(state.index.path(), &new_index)?;
        state.index.set_path(new_index);

        Ok(())
    }

    /// Removes both files from disk.
    pub fn delete(&self) -> Result<(), SegmentError> {
        let state = self.lock_state();
        for path in [&state.log_path, &state.index.path().to_path_buf()] {
            if let Err(e) = fs::remove_file(path)
                && e.kind() != io::ErrorKind::NotFound
            {
                return Err(e.into());
            }
        }
        debug!(base_offset = self.base_offset, "deleted segment files");
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SegmentState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn swap_suffix(path: &Path, from: &str, to: &str) -> Result<PathBuf, SegmentError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SegmentError::Corrupt(format!("unrepresentable path {path:?}")))?;
    let stem = name.strip_suffix(from).ok_or_else(|| {
        SegmentError::Corrupt(format!("file {name:?} does not end in {from:?}"))
    })?;
    Ok(path.with_file_name(format!("{stem}{to}")))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
