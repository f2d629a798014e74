//! Checkpoint resume arithmetic and corruption handling.

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;
use weibo_harvester::crawl::{CrawlCheckpoint, Direction, TimeRange};

fn at(hour: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap() + Duration::hours(hour)
}

fn range(from: i64, to: i64) -> TimeRange {
    TimeRange::new(at(from), at(to)).unwrap()
}

/// Pause at page 12 leaves the checkpoint pointing at page 13 of the same
/// shard, mirroring the pause/resume scenario.
#[test]
fn page_checkpoint_resumes_mid_shard() {
    let mut checkpoint = CrawlCheckpoint::new_backward(Uuid::new_v4(), range(42, 44));
    for page in 1..=12 {
        checkpoint.record_page(page + 1);
    }
    assert_eq!(checkpoint.current_page, 13);
    assert_eq!(checkpoint.direction, Direction::Backward);
    checkpoint.validate().unwrap();

    let json = serde_json::to_string(&checkpoint).unwrap();
    let restored: CrawlCheckpoint = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.current_page, 13);
    assert_eq!(restored.current_range, range(42, 44));
}

/// Completed shards accumulate as a disjoint partition; resume planning sees
/// only the gaps.
#[test]
fn uncovered_time_shrinks_as_shards_complete() {
    let full = range(0, 48);
    let mut checkpoint = CrawlCheckpoint::new_backward(Uuid::new_v4(), range(36, 48));

    // Finish the newest shard, move onto the next one.
    checkpoint.record_completed_shard(Some(range(24, 36)));
    checkpoint.validate().unwrap();

    let gaps = checkpoint.uncovered(full);
    // Completed [36,48) and current [24,36): only the older half remains.
    assert_eq!(gaps, vec![range(0, 24)]);

    checkpoint.record_completed_shard(Some(range(0, 24)));
    let gaps = checkpoint.uncovered(full);
    assert!(gaps.is_empty());
}

/// Garbage persisted state must be detected, never silently reset.
#[test]
fn corrupt_payload_is_rejected() {
    assert!(serde_json::from_str::<CrawlCheckpoint>("{\"task_id\":42}").is_err());
    assert!(serde_json::from_str::<CrawlCheckpoint>("not json").is_err());
}

/// Structural corruption (overlaps, inversions) fails validation even when
/// the JSON decodes.
#[test]
fn structural_corruption_fails_validation() {
    let mut checkpoint = CrawlCheckpoint::new_backward(Uuid::new_v4(), range(0, 6));
    checkpoint.completed_shards = vec![range(6, 18), range(12, 24)];
    assert!(checkpoint.validate().is_err());

    let mut inverted = CrawlCheckpoint::new_backward(Uuid::new_v4(), range(0, 6));
    inverted.current_page = 0;
    assert!(inverted.validate().is_err());
}

/// Switching to the forward pass repositions the window and resets paging.
#[test]
fn forward_handoff_resets_paging() {
    let mut checkpoint = CrawlCheckpoint::new_backward(Uuid::new_v4(), range(0, 12));
    checkpoint.record_page(31);
    checkpoint.record_completed_shard(None);

    checkpoint.advance_to_forward(range(47, 48));
    assert_eq!(checkpoint.direction, Direction::Forward);
    assert_eq!(checkpoint.current_page, 1);
    assert_eq!(checkpoint.current_range, range(47, 48));
    // History stays on record for invariant checks.
    assert_eq!(checkpoint.completed_shards, vec![range(0, 12)]);
    checkpoint.validate().unwrap();
}
