//! Worker pool, dirtiest-first scheduling, and engine lifecycle.
//!
//! The [`CleanerManager`] owns N blocking worker threads, the shared
//! [`Throttler`], one [`CheckpointFile`] per data directory, and the
//! `in_progress` set that guarantees at most one worker per partition.
//! Workers reach the shared state only through the [`CleanerCoordinator`]
//! capability — select a log, finish or abort a claim — so there are no
//! back-pointers from workers to the manager.
//!
//! Each worker loops: select the dirtiest eligible log → clean it →
//! checkpoint the result → repeat, sleeping `back_off_ms` whenever no log
//! crosses its cleanable-ratio threshold. Errors never escape the loop; a
//! failing log is released and the worker moves on.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointError, CheckpointFile};
use crate::cleaner::{CleanError, Cleaner, CleanerStats, LogToClean};
use crate::log::{LogRegistry, TopicPartition};
use crate::offset_map::HashAlgorithm;
use crate::throttler::{DEFAULT_CHECK_INTERVAL_MS, Throttler};

/// Hard per-worker ceiling on dedupe buffer memory.
const MAX_DEDUPE_BUFFER_PER_WORKER: usize = 2 * 1024 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// CleanerConfig
// ------------------------------------------------------------------------------------------------

/// Engine-wide cleaner configuration.
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Number of worker threads.
    pub num_threads: usize,

    /// Total offset-map memory, divided evenly among workers and capped
    /// at 2 GiB per worker.
    pub dedupe_buffer_size: usize,

    /// Utilization ceiling for the offset map; also controls the early
    /// stop during map building.
    pub dedupe_buffer_load_factor: f64,

    /// Per-worker I/O buffer budget, halved between the read and write
    /// sides.
    pub io_buffer_size: usize,

    /// Largest record frame the cleaner will buffer; exceeding it aborts
    /// the log being cleaned.
    pub max_message_size: usize,

    /// Global ceiling on cleaner read+write throughput.
    pub max_io_bytes_per_second: f64,

    /// Idle sleep when no log is cleanable.
    pub back_off_ms: u64,

    /// Interval between throttler rate checks.
    pub throttle_check_interval_ms: u64,

    /// Digest used by the offset map.
    pub hash_algorithm: HashAlgorithm,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            dedupe_buffer_size: 128 * 1024 * 1024,
            dedupe_buffer_load_factor: 0.75,
            io_buffer_size: 512 * 1024,
            max_message_size: 1024 * 1024,
            max_io_bytes_per_second: f64::INFINITY,
            back_off_ms: 15_000,
            throttle_check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            hash_algorithm: HashAlgorithm::Sha256,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// CleanerCoordinator
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CoordState {
    in_progress: HashSet<TopicPartition>,
}

/// The capability workers hold: selection, completion, and the shared
/// checkpoint stores. One global mutex guards the `in_progress` set and
/// serializes checkpoint read-modify-write cycles across workers.
pub struct CleanerCoordinator {
    registry: LogRegistry,
    checkpoints: HashMap<PathBuf, CheckpointFile>,
    state: Mutex<CoordState>,
    completion: Condvar,
}

impl CleanerCoordinator {
    fn new(
        data_dirs: &[PathBuf],
        registry: LogRegistry,
    ) -> Result<Self, CheckpointError> {
        let mut checkpoints = HashMap::with_capacity(data_dirs.len());
        for dir in data_dirs {
            std::fs::create_dir_all(dir).map_err(CheckpointError::Io)?;
            let canonical = dir.canonicalize().map_err(CheckpointError::Io)?;
            checkpoints.insert(canonical.clone(), CheckpointFile::new(&canonical)?);
        }
        Ok(Self {
            registry,
            checkpoints,
            state: Mutex::new(CoordState::default()),
            completion: Condvar::new(),
        })
    }

    /// Picks the unclaimed compacted log with the highest cleanable ratio
    /// above its per-log threshold, claiming it. `None` when nothing is
    /// eligible.
    pub fn select_dirtiest(&self) -> Option<LogToClean> {
        let mut state = self.lock_state();
        let last_clean = self.all_checkpoints();

        let mut best: Option<(LogToClean, f64)> = None;
        for (partition, log) in self.registry.live_logs() {
            let config = log.config();
            if !config.compact || state.in_progress.contains(&partition) {
                continue;
            }
            let first_dirty = last_clean.get(&partition).copied().unwrap_or(0);
            let candidate = LogToClean::new(partition, log, first_dirty);
            if candidate.total_bytes() == 0 {
                continue;
            }
            let ratio = candidate.cleanable_ratio();
            if ratio <= config.min_cleanable_ratio {
                continue;
            }
            debug!(
                partition = %candidate.partition,
                ratio,
                first_dirty,
                "cleanable candidate"
            );
            if best.as_ref().is_none_or(|(_, best_ratio)| ratio > *best_ratio) {
                best = Some((candidate, ratio));
            }
        }

        let selected = best.map(|(candidate, _)| candidate);
        if let Some(candidate) = &selected {
            state.in_progress.insert(candidate.partition.clone());
        }
        selected
    }

    /// Records `end_offset` as the partition's new first-dirty-offset and
    /// releases the claim. The claim is released even when the checkpoint
    /// rewrite fails.
    pub fn finish_cleaning(
        &self,
        partition: &TopicPartition,
        data_dir: &Path,
        end_offset: u64,
    ) -> Result<(), CheckpointError> {
        let mut state = self.lock_state();
        let result = match self.checkpoint_for(data_dir) {
            Some(checkpoint) => checkpoint.update(partition, end_offset),
            None => {
                warn!(
                    %partition,
                    data_dir = %data_dir.display(),
                    "no checkpoint store for data directory, progress not recorded"
                );
                Ok(())
            }
        };
        state.in_progress.remove(partition);
        self.completion.notify_all();
        result
    }

    /// Releases a claim without touching the checkpoint (cancellation
    /// path: an interrupted run records no progress).
    pub fn abort_cleaning(&self, partition: &TopicPartition) {
        let mut state = self.lock_state();
        state.in_progress.remove(partition);
        self.completion.notify_all();
    }

    /// Blocks until the checkpoint for `partition` reaches `offset`, or
    /// until `timeout`. Returns whether the target was reached.
    pub fn await_cleaned(
        &self,
        partition: &TopicPartition,
        offset: u64,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        loop {
            if self
                .all_checkpoints()
                .get(partition)
                .is_some_and(|cleaned| *cleaned >= offset)
            {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .completion
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            state = guard;
        }
    }

    /// Partitions currently being cleaned. Test and introspection hook.
    pub fn in_progress(&self) -> HashSet<TopicPartition> {
        self.lock_state().in_progress.clone()
    }

    fn all_checkpoints(&self) -> HashMap<TopicPartition, u64> {
        let mut merged = HashMap::new();
        for (dir, checkpoint) in &self.checkpoints {
            match checkpoint.read() {
                Ok(entries) => merged.extend(entries),
                Err(e) => warn!(
                    data_dir = %dir.display(),
                    error = %e,
                    "unreadable cleaner checkpoint, treating directory as uncleaned"
                ),
            }
        }
        merged
    }

    fn checkpoint_for(&self, data_dir: &Path) -> Option<&CheckpointFile> {
        let canonical = data_dir.canonicalize().ok()?;
        self.checkpoints.get(&canonical)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CoordState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ------------------------------------------------------------------------------------------------
// CleanerManager
// ------------------------------------------------------------------------------------------------

/// Lifecycle owner of the compaction engine.
///
/// Construct with the engine config, the broker's data directories, and
/// the shared [`LogRegistry`]; then [`startup`](Self::startup) to spawn
/// workers and [`shutdown`](Self::shutdown) to stop and join them.
pub struct CleanerManager {
    config: CleanerConfig,
    coordinator: Arc<CleanerCoordinator>,
    throttler: Arc<Throttler>,
    cancel: Arc<AtomicBool>,
    shutdown_signal: Arc<(Mutex<bool>, Condvar)>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CleanerManager {
    /// Builds the engine. Creates missing data directories and opens (or
    /// initializes) their checkpoint stores.
    pub fn new(
        config: CleanerConfig,
        data_dirs: Vec<PathBuf>,
        registry: LogRegistry,
    ) -> Result<Self, CheckpointError> {
        let coordinator = Arc::new(CleanerCoordinator::new(&data_dirs, registry)?);
        let throttler = Arc::new(Throttler::new(
            config.max_io_bytes_per_second,
            config.throttle_check_interval_ms,
        ));
        Ok(Self {
            config,
            coordinator,
            throttler,
            cancel: Arc::new(AtomicBool::new(false)),
            shutdown_signal: Arc::new((Mutex::new(false), Condvar::new())),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the worker threads. Idempotent.
    pub fn startup(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        if !workers.is_empty() {
            return;
        }

        let per_worker_memory = (self.config.dedupe_buffer_size
            / self.config.num_threads.max(1))
        .min(MAX_DEDUPE_BUFFER_PER_WORKER);

        info!(
            threads = self.config.num_threads,
            map_memory_per_worker = per_worker_memory,
            "starting log cleaner"
        );

        for id in 0..self.config.num_threads {
            let config = self.config.clone();
            let coordinator = Arc::clone(&self.coordinator);
            let throttler = Arc::clone(&self.throttler);
            let cancel = Arc::clone(&self.cancel);
            let shutdown_signal = Arc::clone(&self.shutdown_signal);
            let handle = std::thread::Builder::new()
                .name(format!("log-cleaner-{id}"))
                .spawn(move || {
                    run_worker(
                        id,
                        config,
                        per_worker_memory,
                        coordinator,
                        throttler,
                        cancel,
                        shutdown_signal,
                    );
                })
                .expect("failed to spawn cleaner worker thread");
            workers.push(handle);
        }
    }

    /// Signals cancellation and joins every worker. Runs in flight finish
    /// their current chunk, release their claims, and exit without
    /// recording progress.
    pub fn shutdown(&self) {
        info!("shutting down log cleaner");
        self.cancel.store(true, Ordering::SeqCst);
        {
            let (lock, cvar) = &*self.shutdown_signal;
            let mut flagged = lock.lock().unwrap_or_else(|p| p.into_inner());
            *flagged = true;
            cvar.notify_all();
        }
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                error!("cleaner worker panicked during shutdown");
            }
        }
        info!("log cleaner stopped");
    }

    /// The coordinator capability — selection, completion, progress
    /// queries. Exposed for embedders and deterministic tests.
    pub fn coordinator(&self) -> &CleanerCoordinator {
        &self.coordinator
    }

    /// Test hook: blocks until `partition`'s checkpoint reaches `offset`
    /// or `timeout` elapses. Returns whether the target was reached.
    pub fn await_cleaned(
        &self,
        partition: &TopicPartition,
        offset: u64,
        timeout: Duration,
    ) -> bool {
        self.coordinator.await_cleaned(partition, offset, timeout)
    }
}

// ------------------------------------------------------------------------------------------------
// Worker loop
// ------------------------------------------------------------------------------------------------

fn run_worker(
    id: usize,
    config: CleanerConfig,
    map_memory: usize,
    coordinator: Arc<CleanerCoordinator>,
    throttler: Arc<Throttler>,
    cancel: Arc<AtomicBool>,
    shutdown_signal: Arc<(Mutex<bool>, Condvar)>,
) {
    let mut cleaner = Cleaner::new(
        id,
        map_memory,
        config.hash_algorithm,
        config.dedupe_buffer_load_factor,
        config.io_buffer_size,
        config.max_message_size,
        throttler,
        Arc::clone(&cancel),
    );
    info!(worker = id, "cleaner worker started");

    while !cancel.load(Ordering::SeqCst) {
        let Some(to_clean) = coordinator.select_dirtiest() else {
            back_off(&shutdown_signal, Duration::from_millis(config.back_off_ms));
            continue;
        };

        let partition = to_clean.partition.clone();
        let data_dir = data_dir_of(&to_clean);
        let first_dirty = to_clean.first_dirty_offset;

        match cleaner.clean(&to_clean) {
            Ok((end_offset, stats)) => {
                log_clean_summary(id, &partition, end_offset, &stats);
                record_progress(&coordinator, &partition, &data_dir, end_offset);
            }
            Err(CleanError::Cancelled) => {
                info!(worker = id, %partition, "clean interrupted by shutdown");
                coordinator.abort_cleaning(&partition);
            }
            Err(CleanError::TruncatedDuringClean) => {
                warn!(
                    worker = id,
                    %partition,
                    "log truncated mid-clean, no progress recorded"
                );
                record_progress(&coordinator, &partition, &data_dir, first_dirty);
            }
            Err(e @ (CleanError::CorruptRecord(_) | CleanError::MessageTooLarge { .. })) => {
                error!(
                    worker = id,
                    %partition,
                    error = %e,
                    "uncleanable log, operator attention required"
                );
                record_progress(&coordinator, &partition, &data_dir, first_dirty);
            }
            Err(e) => {
                error!(worker = id, %partition, error = %e, "clean failed, backing off");
                record_progress(&coordinator, &partition, &data_dir, first_dirty);
                back_off(&shutdown_signal, Duration::from_millis(config.back_off_ms));
            }
        }
    }
    info!(worker = id, "cleaner worker stopped");
}

/// Data directory owning the log (the parent of the partition directory).
fn data_dir_of(to_clean: &LogToClean) -> PathBuf {
    let dir = to_clean.log.dir();
    dir.parent().map(Path::to_path_buf).unwrap_or(dir)
}

fn record_progress(
    coordinator: &CleanerCoordinator,
    partition: &TopicPartition,
    data_dir: &Path,
    end_offset: u64,
) {
    if let Err(e) = coordinator.finish_cleaning(partition, data_dir, end_offset) {
        error!(%partition, error = %e, "failed to rewrite cleaner checkpoint");
    }
}

fn log_clean_summary(
    worker: usize,
    partition: &TopicPartition,
    end_offset: u64,
    stats: &CleanerStats,
) {
    info!(
        worker,
        %partition,
        end_offset,
        bytes_read = stats.bytes_read,
        bytes_written = stats.bytes_written,
        messages_read = stats.messages_read,
        messages_written = stats.messages_written,
        shrinkage_pct = %format!("{:.1}", stats.shrinkage() * 100.0),
        map_build_ms = stats.map_build_duration.as_millis() as u64,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        "cleaned log"
    );
}

/// Interruptible back-off: sleeps up to `duration` but wakes immediately
/// on shutdown.
fn back_off(signal: &(Mutex<bool>, Condvar), duration: Duration) {
    let (lock, cvar) = signal;
    let flagged = lock.lock().unwrap_or_else(|p| p.into_inner());
    if !*flagged {
        let _ = cvar
            .wait_timeout(flagged, duration)
            .unwrap_or_else(|p| p.into_inner());
    }
}
