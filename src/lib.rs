//! # EmberLog
//!
//! The **log compaction engine** of a partitioned, append-only,
//! offset-addressed commit log. For every partition configured with the
//! *compact* retention policy the engine continuously collapses per-key
//! history: of all records carrying the same key, only the one at the
//! highest offset survives. Records with a null payload are **tombstones**
//! marking deletion; they are retained for a bounded grace period and then
//! dropped.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     CleanerManager                        │
//! │  ┌───────────┐   select dirtiest    ┌─────────────────┐   │
//! │  │ Worker 0  │◄─────────────────────┤  Coordinator    │   │
//! │  │ Worker 1  │   finish / abort     │  in-progress    │   │
//! │  │   ...     ├─────────────────────►│  checkpoints    │   │
//! │  └─────┬─────┘                      └─────────────────┘   │
//! │        │ clean one log                                    │
//! │  ┌─────▼──────────────────────────────────────────────┐   │
//! │  │ Cleaner: build OffsetMap → group → rewrite → swap  │   │
//! │  └─────┬───────────────┬────────────────┬─────────────┘   │
//! │        │               │                │                 │
//! │  ┌─────▼─────┐   ┌─────▼─────┐   ┌──────▼──────┐          │
//! │  │ OffsetMap │   │ Throttler │   │  Segments   │          │
//! │  │ (per      │   │ (shared)  │   │ (.cleaned   │          │
//! │  │  worker)  │   │           │   │  staging)   │          │
//! │  └───────────┘   └───────────┘   └─────────────┘          │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`segment`] | On-disk segment pair: CRC-framed record file + sparse offset index |
//! | [`log`] | The `Log` capability consumed by the engine, plus a file-backed reference implementation |
//! | [`offset_map`] | Bounded-memory digest→offset table used for key deduplication |
//! | [`throttler`] | Shared byte-rate limiter over all cleaner I/O |
//! | [`checkpoint`] | Durable per-directory record of cleaning progress |
//! | [`cleaner`] | Per-log cleaning algorithm and the filtered segment rewriter |
//! | [`manager`] | Worker pool, dirtiest-first scheduling, lifecycle |
//!
//! ## Key guarantees
//!
//! - **Last-write-wins:** after a clean, a key's surviving record is the one
//!   at its highest offset inside the cleaned range.
//! - **Offset preservation:** surviving records keep their original offsets
//!   byte-for-byte; the rewriter never renumbers.
//! - **Tombstone grace:** tombstones survive until their segment's age
//!   crosses the configured delete horizon.
//! - **Abort safety:** a log truncated mid-clean fails the optimistic swap;
//!   staged files are removed and the checkpoint is not advanced.
//! - **Active segment untouched:** the append path is never read, rewritten,
//!   or locked outside the brief swap window.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use emberlog::log::{LogConfig, LogRegistry, SegmentedLog, TopicPartition};
//! use emberlog::manager::{CleanerConfig, CleanerManager};
//!
//! let registry = LogRegistry::new();
//! let log = Arc::new(
//!     SegmentedLog::open("/data/orders-0", LogConfig::compacted()).unwrap(),
//! );
//! registry.insert(TopicPartition::new("orders", 0), &log);
//!
//! let manager = CleanerManager::new(
//!     CleanerConfig::default(),
//!     vec!["/data".into()],
//!     registry.clone(),
//! )
//! .unwrap();
//! manager.startup();
//! // ... broker serves traffic; the cleaner reclaims space in the background.
//! manager.shutdown();
//! ```

pub mod checkpoint;
pub mod cleaner;
pub mod log;
pub mod manager;
pub mod offset_map;
pub mod segment;
pub mod throttler;

pub use cleaner::{CleanError, CleanerStats};
pub use log::{Log, LogConfig, TopicPartition};
pub use manager::{CleanerConfig, CleanerManager};
