//! Durable record of cleaning progress, one file per data directory.
//!
//! Each data directory carries a `cleaner-offset-checkpoint` file holding,
//! for every partition whose log lives in that directory, the first offset
//! **not yet cleaned** — the boundary between the clean prefix and the
//! dirty suffix of that partition's log.
//!
//! # On-disk format
//!
//! Line-oriented text, rewritten atomically on every update (write to a
//! temp file, fsync, rename over the live file, fsync the directory):
//!
//! ```text
//! 0                          <- format version
//! 2                          <- entry count
//! orders 0 1523
//! payments 3 88
//! ```
//!
//! A missing file reads as an empty mapping. Successive values for a
//! partition never decrease; the engine only writes forward progress.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, trace};

use crate::log::TopicPartition;

/// Name of the checkpoint file inside each data directory.
pub const CHECKPOINT_FILE_NAME: &str = "cleaner-offset-checkpoint";

/// Suffix of the scratch file used for atomic rewrites.
const TMP_SUFFIX: &str = ".tmp";

/// Current (and only) supported format version.
const VERSION: u32 = 0;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file declares a format version this build does not understand.
    #[error("Unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),

    /// A line failed to parse, or the entry count disagreed with the body.
    #[error("Malformed checkpoint file: {0}")]
    Malformed(String),
}

// ------------------------------------------------------------------------------------------------
// CheckpointFile
// ------------------------------------------------------------------------------------------------

/// Handle to one data directory's `cleaner-offset-checkpoint` file.
///
/// Reads and atomic rewrites are serialized through an internal mutex;
/// cross-directory serialization is the coordinator's responsibility.
#[derive(Debug)]
pub struct CheckpointFile {
    path: PathBuf,
    tmp_path: PathBuf,
    lock: Mutex<()>,
}

impl CheckpointFile {
    /// Creates a handle for the checkpoint file in `dir`.
    ///
    /// The directory must exist; the file itself need not.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(CheckpointError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("data directory {} does not exist", dir.display()),
            )));
        }
        let path = dir.join(CHECKPOINT_FILE_NAME);
        let tmp_path = dir.join(format!("{CHECKPOINT_FILE_NAME}{TMP_SUFFIX}"));
        Ok(Self {
            path,
            tmp_path,
            lock: Mutex::new(()),
        })
    }

    /// Path of the live checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the full mapping. A missing file yields an empty map.
    pub fn read(&self) -> Result<HashMap<TopicPartition, u64>, CheckpointError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.read_locked()
    }

    /// Atomically replaces the file contents with `entries`.
    pub fn write(
        &self,
        entries: &HashMap<TopicPartition, u64>,
    ) -> Result<(), CheckpointError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.write_locked(entries)
    }

    /// Read-modify-write: overlays `(partition → offset)` onto the current
    /// contents and rewrites the file.
    pub fn update(
        &self,
        partition: &TopicPartition,
        offset: u64,
    ) -> Result<(), CheckpointError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries = self.read_locked()?;
        entries.insert(partition.clone(), offset);
        self.write_locked(&entries)
    }

    fn read_locked(&self) -> Result<HashMap<TopicPartition, u64>, CheckpointError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(path = %self.path.display(), "no checkpoint file, starting empty");
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let version: u32 = Self::next_line(&mut lines, "version")?
            .trim()
            .parse()
            .map_err(|_| CheckpointError::Malformed("unparseable version line".into()))?;
        if version != VERSION {
            return Err(CheckpointError::UnsupportedVersion(version));
        }

        let expected: usize = Self::next_line(&mut lines, "entry count")?
            .trim()
            .parse()
            .map_err(|_| CheckpointError::Malformed("unparseable count line".into()))?;

        let mut entries = HashMap::with_capacity(expected);
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (topic, partition, offset) = match (parts.next(), parts.next(), parts.next()) {
                (Some(t), Some(p), Some(o)) => (t, p, o),
                _ => {
                    return Err(CheckpointError::Malformed(format!(
                        "expected '<topic> <partition> <offset>', got {line:?}"
                    )));
                }
            };
            let partition: u32 = partition.parse().map_err(|_| {
                CheckpointError::Malformed(format!("bad partition id in {line:?}"))
            })?;
            let offset: u64 = offset
                .parse()
                .map_err(|_| CheckpointError::Malformed(format!("bad offset in {line:?}")))?;
            entries.insert(TopicPartition::new(topic, partition), offset);
        }

        if entries.len() != expected {
            return Err(CheckpointError::Malformed(format!(
                "entry count {expected} disagrees with {} body lines",
                entries.len()
            )));
        }

        Ok(entries)
    }

    fn write_locked(
        &self,
        entries: &HashMap<TopicPartition, u64>,
    ) -> Result<(), CheckpointError> {
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.tmp_path)?;

        writeln!(tmp, "{VERSION}")?;
        writeln!(tmp, "{}", entries.len())?;
        // Deterministic order keeps the file diffable across rewrites.
        let mut sorted: Vec<_> = entries.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        for (tp, offset) in sorted {
            writeln!(tmp, "{} {} {}", tp.topic(), tp.partition(), offset)?;
        }
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&self.tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent()
            && let Ok(dir_handle) = File::open(dir)
        {
            dir_handle.sync_all()?;
        }

        debug!(
            path = %self.path.display(),
            entries = entries.len(),
            "checkpoint rewritten"
        );
        Ok(())
    }

    fn next_line(
        lines: &mut io::Lines<BufReader<File>>,
        what: &str,
    ) -> Result<String, CheckpointError> {
        match lines.next() {
            Some(line) => Ok(line?),
            None => Err(CheckpointError::Malformed(format!("missing {what} line"))),
        }
    }
}
