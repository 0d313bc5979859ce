//! Bounded-memory digest→offset table used for key deduplication.
//!
//! During the map-building phase of a clean, every record key in the dirty
//! section is hashed and inserted with its offset. Because the dirty section
//! is scanned in offset order, the entry a key ends up with is always the
//! offset of its **latest** write inside the scanned range; the rewrite
//! phase then drops any record whose offset is below its key's map entry.
//!
//! The table is a single contiguous byte buffer of fixed-width slots
//! (`digest || offset`), probed with open addressing. There is no resize:
//! callers watch [`OffsetMap::utilization`] and stop feeding keys before
//! the configured load factor is crossed.
//!
//! Distinct keys hashing to the same digest collapse onto one slot and
//! yield the later offset. That is a designed approximation: a collision
//! can retain strictly more records than necessary, never fewer.

use sha2::{Digest as _, Sha256};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_128;

/// Width of a stored key digest in bytes.
pub const DIGEST_LEN: usize = 16;

/// Bytes per slot: digest plus a little-endian `u64` offset.
const SLOT_LEN: usize = DIGEST_LEN + 8;

/// Errors returned by offset map operations.
#[derive(Debug, Error)]
pub enum OffsetMapError {
    /// Attempted to insert a new key into a full map. The build loop is
    /// required to stop feeding keys before this can happen, so hitting
    /// it indicates a caller bug.
    #[error("Offset map is full ({slots} slots occupied)")]
    MapFull {
        /// Total slot count of the map.
        slots: usize,
    },
}

/// Digest function used to condense record keys into fixed-width slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-256 truncated to 16 bytes. Cryptographic; collisions are
    /// statistically negligible over any realistic key population.
    Sha256,
    /// XXH3-128. Not cryptographic, substantially faster; adequate when
    /// key populations are not adversarial.
    Xxh3,
}

impl HashAlgorithm {
    /// Hashes `key` into a 16-byte digest.
    ///
    /// The all-zero digest is reserved as the empty-slot marker, so a key
    /// that happens to hash to all zeroes is nudged onto a sibling digest.
    fn digest(&self, key: &[u8]) -> [u8; DIGEST_LEN] {
        let mut out = [0u8; DIGEST_LEN];
        match self {
            HashAlgorithm::Sha256 => {
                let full = Sha256::digest(key);
                out.copy_from_slice(&full[..DIGEST_LEN]);
            }
            HashAlgorithm::Xxh3 => {
                out.copy_from_slice(&xxh3_128(key).to_le_bytes());
            }
        }
        if out == [0u8; DIGEST_LEN] {
            out[DIGEST_LEN - 1] = 1;
        }
        out
    }
}

/// Fixed-capacity associative table mapping key digests to offsets.
///
/// Owned exclusively by one cleaner worker; never shared. See the
/// [module-level documentation](self) for the probing and collision
/// contract.
#[derive(Debug)]
pub struct OffsetMap {
    buf: Vec<u8>,
    slots: usize,
    occupied: usize,
    last_offset: Option<u64>,
    algorithm: HashAlgorithm,
}

impl OffsetMap {
    /// Creates a map sized to `memory_bytes`.
    ///
    /// The slot count is `memory_bytes / 24` (16-byte digest + 8-byte
    /// offset), with a floor of one slot.
    pub fn new(memory_bytes: usize, algorithm: HashAlgorithm) -> Self {
        let slots = (memory_bytes / SLOT_LEN).max(1);
        Self {
            buf: vec![0u8; slots * SLOT_LEN],
            slots,
            occupied: 0,
            last_offset: None,
            algorithm,
        }
    }

    /// Total number of slots.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Fraction of slots currently occupied, in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        self.occupied as f64 / self.slots as f64
    }

    /// The highest offset successfully inserted since the last clear.
    pub fn last_offset(&self) -> Option<u64> {
        self.last_offset
    }

    /// Inserts or overwrites the entry for `key`.
    ///
    /// Overwrites always succeed, even on a full map. An insert into a
    /// full map fails with [`OffsetMapError::MapFull`].
    pub fn put(&mut self, key: &[u8], offset: u64) -> Result<(), OffsetMapError> {
        let digest = self.algorithm.digest(key);
        let start = Self::probe_start(&digest, self.slots);

        for attempt in 0..self.slots {
            let slot = (start + attempt) % self.slots;
            let base = slot * SLOT_LEN;
            let stored = &self.buf[base..base + DIGEST_LEN];

            if stored == [0u8; DIGEST_LEN] {
                // Empty slot — new insert.
                if self.occupied == self.slots {
                    return Err(OffsetMapError::MapFull { slots: self.slots });
                }
                self.buf[base..base + DIGEST_LEN].copy_from_slice(&digest);
                self.buf[base + DIGEST_LEN..base + SLOT_LEN]
                    .copy_from_slice(&offset.to_le_bytes());
                self.occupied += 1;
                self.note_offset(offset);
                return Ok(());
            }

            if stored == digest {
                // Existing key — overwrite.
                self.buf[base + DIGEST_LEN..base + SLOT_LEN]
                    .copy_from_slice(&offset.to_le_bytes());
                self.note_offset(offset);
                return Ok(());
            }
        }

        // Probed every slot without finding the key or a free slot.
        Err(OffsetMapError::MapFull { slots: self.slots })
    }

    /// Looks up the stored offset for `key`, or `None` if absent.
    pub fn get(&self, key: &[u8]) -> Option<u64> {
        let digest = self.algorithm.digest(key);
        let start = Self::probe_start(&digest, self.slots);

        for attempt in 0..self.slots {
            let slot = (start + attempt) % self.slots;
            let base = slot * SLOT_LEN;
            let stored = &self.buf[base..base + DIGEST_LEN];

            if stored == [0u8; DIGEST_LEN] {
                return None;
            }
            if stored == digest {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&self.buf[base + DIGEST_LEN..base + SLOT_LEN]);
                return Some(u64::from_le_bytes(bytes));
            }
        }

        None
    }

    /// Returns the map to empty: zeroes the buffer and resets counters.
    pub fn clear(&mut self) {
        self.buf.fill(0);
        self.occupied = 0;
        self.last_offset = None;
    }

    fn note_offset(&mut self, offset: u64) {
        self.last_offset = Some(match self.last_offset {
            Some(prev) => prev.max(offset),
            None => offset,
        });
    }

    fn probe_start(digest: &[u8; DIGEST_LEN], slots: usize) -> usize {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(bytes) % slots as u64) as usize
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
