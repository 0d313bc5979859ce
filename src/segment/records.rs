//! Record wire format.
//!
//! Every record is stored as one self-delimiting, CRC-protected frame:
//!
//! ```text
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ```
//!
//! - 4-byte little-endian length prefix,
//! - serialized record bytes ([`bincode`], fixed-int little-endian),
//! - 4-byte CRC32 checksum computed over `len || record_bytes`.
//!
//! Frames are the unit of verbatim copy during compaction: a surviving
//! record's frame is transplanted into the destination segment unchanged,
//! which preserves its offset, timestamp, and checksum byte-for-byte.

use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use bincode::{config::standard, decode_from_slice, encode_to_vec};
use crc32fast::Hasher as Crc32;

use super::SegmentError;

/// Length-prefix plus trailing-CRC bytes around every record.
pub const FRAME_OVERHEAD: usize = 2 * std::mem::size_of::<u32>();

/// Bincode configuration shared by encode and decode paths.
pub(crate) fn wire_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    standard().with_fixed_int_encoding()
}

/// One record of a partitioned log.
///
/// `key: None` is forbidden in a compacted log (the cleaner aborts on it);
/// `value: None` marks a **tombstone** — a logical deletion of the key.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Record {
    /// Offset assigned at append time; strictly increasing per partition.
    pub offset: u64,

    /// Producer timestamp in milliseconds since the epoch.
    pub timestamp: i64,

    /// Record key. Compacted logs require every record to carry one.
    pub key: Option<Vec<u8>>,

    /// Record payload; `None` marks a tombstone.
    pub value: Option<Vec<u8>>,
}

impl Record {
    /// Creates a keyed record.
    pub fn new(offset: u64, timestamp: i64, key: impl Into<Vec<u8>>, value: Option<Vec<u8>>) -> Self {
        Self {
            offset,
            timestamp,
            key: Some(key.into()),
            value,
        }
    }

    /// True when this record is a deletion marker.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Appends the frame for `record` to `out`; returns the frame length.
pub fn encode_frame(record: &Record, out: &mut Vec<u8>) -> Result<usize, SegmentError> {
    let body = encode_to_vec(record, wire_config())?;
    let len = body.len() as u32;

    let mut hasher = Crc32::new();
    hasher.update(&len.to_le_bytes());
    hasher.update(&body);
    let checksum = hasher.finalize();

    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&checksum.to_le_bytes());
    Ok(body.len() + FRAME_OVERHEAD)
}

/// Decodes the first frame in `buf`.
///
/// Returns `Ok(None)` when `buf` holds only a partial frame — the caller
/// is expected to refill (or grow) its buffer and retry. A checksum or
/// decode failure is a hard error: the segment is corrupt.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Record, usize)>, SegmentError> {
    let prefix = std::mem::size_of::<u32>();
    if buf.len() < prefix {
        return Ok(None);
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[..prefix]);
    let body_len = u32::from_le_bytes(len_bytes) as usize;

    let frame_len = body_len + FRAME_OVERHEAD;
    if buf.len() < frame_len {
        return Ok(None);
    }

    let body = &buf[prefix..prefix + body_len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&buf[prefix + body_len..frame_len]);
    let stored = u32::from_le_bytes(crc_bytes);

    let mut hasher = Crc32::new();
    hasher.update(&len_bytes);
    hasher.update(body);
    if hasher.finalize() != stored {
        return Err(SegmentError::ChecksumMismatch);
    }

    let (record, _) = decode_from_slice::<Record, _>(body, wire_config())?;
    Ok(Some((record, frame_len)))
}

/// Decodes every complete frame in `buf`, ignoring a partial tail.
pub fn decode_all(buf: &[u8]) -> Result<Vec<Record>, SegmentError> {
    let mut records = Vec::new();
    let mut pos = 0;
    while let Some((record, frame_len)) = decode_frame(&buf[pos..])? {
        records.push(record);
        pos += frame_len;
    }
    Ok(records)
}
