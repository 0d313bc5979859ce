//! Shared byte-rate limiter for cleaner I/O.
//!
//! One [`Throttler`] instance is shared by every cleaner worker so that the
//! *aggregate* read+write rate of the engine honors a single global ceiling.
//! Callers account bytes through [`Throttler::maybe_throttle`]; when the
//! observed rate over the current window exceeds the configured target, the
//! caller is blocked just long enough to bring the windowed rate back down.
//!
//! The fast path (window still open, budget not exceeded) takes one mutex
//! and one monotonic clock read — no sleeping, no I/O.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// Default interval between rate checks.
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 300;

#[derive(Debug)]
struct Window {
    start: Instant,
    bytes: u64,
}

/// A windowed rate limiter shared across cleaner workers.
///
/// Thread-safe; throttled callers sleep while holding the internal lock so
/// that concurrent workers collectively respect one global budget rather
/// than each enjoying the full ceiling.
#[derive(Debug)]
pub struct Throttler {
    desired_bytes_per_sec: f64,
    check_interval: Duration,
    window: Mutex<Window>,
}

impl Throttler {
    /// Creates a throttler with the given rate ceiling.
    ///
    /// A non-finite `desired_bytes_per_sec` (e.g. `f64::INFINITY`) disables
    /// throttling entirely.
    pub fn new(desired_bytes_per_sec: f64, check_interval_ms: u64) -> Self {
        Self {
            desired_bytes_per_sec,
            check_interval: Duration::from_millis(check_interval_ms),
            window: Mutex::new(Window {
                start: Instant::now(),
                bytes: 0,
            }),
        }
    }

    /// Creates a throttler that never blocks.
    pub fn unlimited() -> Self {
        Self::new(f64::INFINITY, DEFAULT_CHECK_INTERVAL_MS)
    }

    /// Accounts `bytes` against the budget, sleeping if the windowed rate
    /// has risen above the ceiling.
    ///
    /// The sleep is sized so that `window_bytes / (elapsed + sleep)` lands
    /// back at the target rate; afterwards the window resets.
    pub fn maybe_throttle(&self, bytes: u64) {
        if !self.desired_bytes_per_sec.is_finite() {
            return;
        }

        let mut window = self
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        window.bytes = window.bytes.saturating_add(bytes);

        let elapsed = window.start.elapsed();
        if elapsed < self.check_interval {
            return;
        }

        let elapsed_secs = elapsed.as_secs_f64();
        let rate = window.bytes as f64 / elapsed_secs;
        if rate > self.desired_bytes_per_sec {
            let target_secs = window.bytes as f64 / self.desired_bytes_per_sec;
            let sleep = Duration::from_secs_f64(target_secs - elapsed_secs);
            debug!(
                observed_rate = rate as u64,
                target_rate = self.desired_bytes_per_sec as u64,
                sleep_ms = sleep.as_millis() as u64,
                "throttling cleaner I/O"
            );
            std::thread::sleep(sleep);
        } else {
            trace!(
                observed_rate = rate as u64,
                window_bytes = window.bytes,
                "rate check passed"
            );
        }

        window.start = Instant::now();
        window.bytes = 0;
    }

    /// The configured rate ceiling in bytes per second.
    pub fn desired_rate(&self) -> f64 {
        self.desired_bytes_per_sec
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
