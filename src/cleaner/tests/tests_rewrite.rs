//! Segment grouping and rewrite-level tests.

use std::sync::Arc;

use tempfile::TempDir;

use crate::cleaner::rewrite::group_segments_by_size;
use crate::cleaner::tests::helpers::*;
use crate::cleaner::LogToClean;
use crate::log::{Log, SegmentedLog, TopicPartition};

/// # Scenario
/// Segments group greedily under the size budget: three roughly equal
/// segments with a budget of two produce groups of two and one.
///
/// # Starting environment
/// Three sealed segments of equal record counts.
///
/// # Actions
/// 1. Group with `max_size` set to twice one segment's size.
///
/// # Expected behavior
/// - Two groups: the first two segments together, the third alone.
#[test]
fn grouping_respects_size_budget() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Arc::new(SegmentedLog::open(dir.path(), test_log_config()).unwrap());
    for chunk in 0..3u32 {
        for key in 0..4u32 {
            log.append(format!("key-{chunk}-{key}").as_bytes(), Some(b"payload"))
                .unwrap();
        }
        log.roll().unwrap();
    }

    let segments = log.segments_in_range(0, log.active_segment().base_offset());
    assert_eq!(segments.len(), 3);
    let one_size = segments[0].size() as u32;

    let groups = group_segments_by_size(&segments, one_size * 2, u32::MAX);

    assert_eq!(groups.len(), 2);
    assert_eq!(
        groups[0].iter().map(|s| s.base_offset()).collect::<Vec<_>>(),
        vec![0, 4]
    );
    assert_eq!(
        groups[1].iter().map(|s| s.base_offset()).collect::<Vec<_>>(),
        vec![8]
    );
}

/// # Scenario
/// The index-size budget constrains grouping independently of the
/// message-file budget.
///
/// # Starting environment
/// Three sealed segments, each with at least one index entry (tiny index
/// interval).
///
/// # Actions
/// 1. Group with an unlimited byte budget but an index budget fitting
///    only one segment's index.
///
/// # Expected behavior
/// - Every segment lands in its own group.
#[test]
fn grouping_respects_index_budget() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = test_log_config();
    config.index_interval_bytes = 16;
    let log = Arc::new(SegmentedLog::open(dir.path(), config).unwrap());
    for chunk in 0..3u32 {
        for key in 0..4u32 {
            log.append(format!("key-{chunk}-{key}").as_bytes(), Some(b"payload"))
                .unwrap();
        }
        log.roll().unwrap();
    }

    let segments = log.segments_in_range(0, log.active_segment().base_offset());
    let one_index = segments[0].index_size_in_bytes() as u32;
    assert!(one_index > 0, "test needs real index entries");

    let groups = group_segments_by_size(&segments, u32::MAX, one_index);

    assert_eq!(groups.len(), 3);
    for group in &groups {
        assert_eq!(group.len(), 1);
    }
}

/// # Scenario
/// A single segment over the size budget still forms a group by itself
/// and is rewritten 1:1 rather than skipped or split.
///
/// # Starting environment
/// One sealed segment larger than `max_size = 1`.
///
/// # Actions
/// 1. Group with a 1-byte budget; clean end to end.
///
/// # Expected behavior
/// - One singleton group; the clean succeeds.
#[test]
fn oversized_segment_forms_singleton_group() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Arc::new(SegmentedLog::open(dir.path(), test_log_config()).unwrap());
    append_all(&log, &[("a", Some("v0")), ("a", Some("v1"))]);
    log.roll().unwrap();

    let segments = log.segments_in_range(0, log.active_segment().base_offset());
    let groups = group_segments_by_size(&segments, 1, u32::MAX);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].len(), 1);

    let candidate = LogToClean::new(
        TopicPartition::new("test", 0),
        Arc::clone(&log) as Arc<dyn Log>,
        0,
    );
    test_cleaner().clean(&candidate).unwrap();
    assert_eq!(contents(&log), vec![(1, "a".into(), Some("v1".into()))]);
}

/// # Scenario
/// Grouping across a multi-segment log merges each group into one
/// replacement segment, leaving the expected post-clean segment count.
///
/// # Starting environment
/// Three sealed segments; group budget of two segment sizes.
///
/// # Actions
/// 1. Clean with a log config whose `segment_size` spans two segments.
///
/// # Expected behavior
/// - Post-clean the log has exactly three segments: two merged
///   replacements plus the active one.
#[test]
fn groups_merge_into_single_replacements() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = test_log_config();
    let log = {
        let log = Arc::new(SegmentedLog::open(dir.path(), config.clone()).unwrap());
        for chunk in 0..3u32 {
            for key in 0..4u32 {
                log.append(format!("key-{chunk}-{key}").as_bytes(), Some(b"payload"))
                    .unwrap();
            }
            log.roll().unwrap();
        }
        log
    };
    let one_size = log.segments_in_range(0, 4)[0].size() as u32;
    drop(log);

    // Reopen with a segment-size budget that fits exactly two segments.
    config.segment_size = one_size * 2;
    let log = Arc::new(SegmentedLog::open(dir.path(), config).unwrap());
    assert_eq!(log.segment_count(), 4);

    let candidate = LogToClean::new(
        TopicPartition::new("test", 0),
        Arc::clone(&log) as Arc<dyn Log>,
        0,
    );
    test_cleaner().clean(&candidate).unwrap();

    // {s0, s1} merged at base 0, {s2} rewritten at base 8, plus active.
    assert_eq!(log.segment_count(), 3);
    assert_eq!(log.read_all().unwrap().len(), 12, "unique keys all survive");
}

/// # Scenario
/// The rewritten segment's sparse index keeps the source's per-interval
/// density even though survivors reach the destination in large write
/// chunks spanning many records.
///
/// # Starting environment
/// One sealed segment of 60 unique-key records with a 64-byte index
/// interval (roughly one entry per record); a cleaner whose write chunks
/// cover several records at once.
///
/// # Actions
/// 1. Record the source's index entry count.
/// 2. Clean 1:1 (nothing to drop).
///
/// # Expected behavior
/// - The replacement's index has at least half as many entries as the
///   source — not one entry per write chunk.
#[test]
fn rewritten_segment_keeps_index_density() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = test_log_config();
    config.index_interval_bytes = 64;
    let log = Arc::new(SegmentedLog::open(dir.path(), config).unwrap());
    for i in 0..60u32 {
        log.append(format!("key-{i:04}").as_bytes(), Some(b"payload"))
            .unwrap();
    }
    log.roll().unwrap();

    let source_entries = log.segments_in_range(0, 60)[0].index_size_in_bytes() / 8;
    assert!(
        source_entries > 20,
        "test needs a densely indexed source, got {source_entries} entries"
    );

    let candidate = LogToClean::new(
        TopicPartition::new("test", 0),
        Arc::clone(&log) as Arc<dyn Log>,
        0,
    );
    let mut cleaner = cleaner_with(1024 * 1024, 0.75, 1024, 64 * 1024);
    cleaner.clean(&candidate).unwrap();

    let rewritten_entries = log.segments_in_range(0, 60)[0].index_size_in_bytes() / 8;
    assert!(
        rewritten_entries * 2 >= source_entries,
        "rewritten index too sparse: {rewritten_entries} entries vs {source_entries} in the source"
    );
}

/// # Scenario
/// Run statistics reflect the filtering work.
///
/// # Starting environment
/// Segment where half the records are stale duplicates.
///
/// # Actions
/// 1. Clean from 0; inspect stats.
///
/// # Expected behavior
/// - `messages_read` counts map build plus rewrite; `messages_written`
///   counts survivors; shrinkage is strictly positive; durations are
///   recorded.
#[test]
fn stats_track_the_run() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Arc::new(SegmentedLog::open(dir.path(), test_log_config()).unwrap());
    append_all(
        &log,
        &[
            ("k1", Some("old")),
            ("k2", Some("old")),
            ("k1", Some("new")),
            ("k2", Some("new")),
        ],
    );
    log.roll().unwrap();

    let candidate = LogToClean::new(
        TopicPartition::new("test", 0),
        Arc::clone(&log) as Arc<dyn Log>,
        0,
    );
    let (_, stats) = test_cleaner().clean(&candidate).unwrap();

    // 4 records indexed during map build + 4 filtered during rewrite.
    assert_eq!(stats.messages_read, 8);
    assert_eq!(stats.messages_written, 2);
    assert!(stats.bytes_read > stats.bytes_written);
    assert!(stats.shrinkage() > 0.0);
    assert!(stats.elapsed >= stats.map_build_duration);
}
