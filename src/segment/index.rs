//! Sparse offset index backing each segment.
//!
//! Maps record offsets (stored relative to the segment's base offset) to
//! physical positions in the message file, with one entry per
//! `index_interval_bytes` of appended data. The file is memory-mapped at
//! its maximum size while the segment is writable and truncated to its
//! valid size when sealed.
//!
//! # On-disk layout
//!
//! ```text
//! [REL_OFFSET_U32_LE][POSITION_U32_LE]   <- entry 0
//! [REL_OFFSET_U32_LE][POSITION_U32_LE]   <- entry 1
//! ...
//! ```

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use super::SegmentError;

/// Bytes per index entry.
pub const ENTRY_LEN: usize = 8;

/// Memory-mapped sparse index over one segment's message file.
#[derive(Debug)]
pub struct OffsetIndex {
    mmap: MmapMut,
    path: PathBuf,
    base_offset: u64,
    entries: usize,
    max_entries: usize,
}

impl OffsetIndex {
    /// Creates a fresh index file sized to `max_size_bytes`, replacing any
    /// stale file at `path`.
    pub fn create(
        path: impl Into<PathBuf>,
        base_offset: u64,
        max_size_bytes: u32,
    ) -> Result<Self, SegmentError> {
        let path = path.into();
        let max_entries = (max_size_bytes as usize / ENTRY_LEN).max(1);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.set_len((max_entries * ENTRY_LEN) as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            mmap,
            path,
            base_offset,
            entries: 0,
            max_entries,
        })
    }

    /// Opens an existing (sealed or in-progress) index file.
    ///
    /// The entry count is recovered by scanning for the first slot that
    /// does not continue the strictly-increasing relative-offset sequence.
    pub fn open(path: impl Into<PathBuf>, base_offset: u64) -> Result<Self, SegmentError> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len() as usize;
        let max_entries = (len / ENTRY_LEN).max(1);
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let mut entries = 0;
        let mut last_rel = None;
        for slot in 0..len / ENTRY_LEN {
            let (rel, pos) = Self::entry_at(&mmap, slot);
            // A zeroed slot is preallocated space, never a real entry:
            // genuine entries always carry a non-zero file position.
            if rel == 0 && pos == 0 {
                break;
            }
            match last_rel {
                None => {}
                Some(prev) if rel > prev => {}
                Some(_) => break,
            }
            last_rel = Some(rel);
            entries = slot + 1;
        }

        Ok(Self {
            mmap,
            path,
            base_offset,
            entries,
            max_entries,
        })
    }

    /// Path of the index file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Updates the stored path after the segment's files were renamed.
    pub(crate) fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    /// Number of entries currently in the index.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Bytes of valid index data.
    pub fn size_in_bytes(&self) -> u64 {
        (self.entries * ENTRY_LEN) as u64
    }

    /// True when no further entries fit.
    pub fn is_full(&self) -> bool {
        self.entries >= self.max_entries
    }

    /// Appends an entry mapping `offset` to `position`.
    ///
    /// Offsets must arrive in strictly increasing order; a full index
    /// silently drops the entry (lookups just get coarser).
    pub fn append(&mut self, offset: u64, position: u32) -> Result<(), SegmentError> {
        if self.is_full() {
            return Ok(());
        }
        if offset < self.base_offset {
            return Err(SegmentError::Corrupt(format!(
                "index entry offset {offset} below base offset {}",
                self.base_offset
            )));
        }
        let rel = u32::try_from(offset - self.base_offset).map_err(|_| {
            SegmentError::Corrupt(format!(
                "offset {offset} overflows relative encoding from base {}",
                self.base_offset
            ))
        })?;
        let start = self.entries * ENTRY_LEN;
        self.mmap[start..start + 4].copy_from_slice(&rel.to_le_bytes());
        self.mmap[start + 4..start + 8].copy_from_slice(&position.to_le_bytes());
        self.entries += 1;
        Ok(())
    }

    /// Returns the greatest `(offset, position)` entry with
    /// `offset <= target`, or `(base_offset, 0)` when none exists.
    pub fn lookup(&self, target: u64) -> (u64, u32) {
        if self.entries == 0 || target < self.base_offset {
            return (self.base_offset, 0);
        }
        let rel_target = (target - self.base_offset).min(u32::MAX as u64) as u32;

        let mut lo = 0usize;
        let mut hi = self.entries;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (rel, _) = Self::entry_at(&self.mmap, mid);
            if rel <= rel_target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            return (self.base_offset, 0);
        }
        let (rel, pos) = Self::entry_at(&self.mmap, lo - 1);
        (self.base_offset + rel as u64, pos)
    }

    /// Drops all entries at or above `offset`.
    pub fn truncate_to(&mut self, offset: u64) {
        while self.entries > 0 {
            let (rel, _) = Self::entry_at(&self.mmap, self.entries - 1);
            if self.base_offset + rel as u64 >= offset {
                self.entries -= 1;
            } else {
                break;
            }
        }
    }

    /// Shrinks the file to exactly the valid entries and remaps.
    pub fn trim_to_valid_size(&mut self) -> Result<(), SegmentError> {
        self.mmap.flush()?;
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.set_len(self.size_in_bytes().max(ENTRY_LEN as u64))?;
        self.mmap = unsafe { MmapMut::map_mut(&file)? };
        self.max_entries = self.entries.max(1);
        Ok(())
    }

    /// Flushes mapped pages to disk.
    pub fn flush(&self) -> Result<(), SegmentError> {
        self.mmap.flush()?;
        Ok(())
    }

    fn entry_at(mmap: &MmapMut, slot: usize) -> (u32, u32) {
        let start = slot * ENTRY_LEN;
        let mut rel = [0u8; 4];
        let mut pos = [0u8; 4];
        rel.copy_from_slice(&mmap[start..start + 4]);
        pos.copy_from_slice(&mmap[start + 4..start + 8]);
        (u32::from_le_bytes(rel), u32::from_le_bytes(pos))
    }
}
