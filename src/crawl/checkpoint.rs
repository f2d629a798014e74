//! Crawl checkpoints
//!
//! One checkpoint per task at `<ns>:crawl:ckpt:<task_id>`, updated at three
//! granularities: task status changes, shard completion, and after every
//! persisted page. A checkpoint that no longer deserializes marks the task
//! Failed; it is never auto-reset.

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HarvestError, Result};
use crate::storage;

use super::time_range::TimeRange;

/// Which pass the checkpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Backward,
    Forward,
}

/// Resume point of one crawl task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlCheckpoint {
    pub task_id: Uuid,
    pub direction: Direction,
    /// Shard currently being paged through (backward), or the incremental
    /// window (forward)
    pub current_range: TimeRange,
    /// 1-based; the next page to fetch
    pub current_page: u32,
    /// Disjoint, hour-aligned shards already fully persisted
    pub completed_shards: Vec<TimeRange>,
    pub saved_at: DateTime<Utc>,
}

impl CrawlCheckpoint {
    /// Fresh backward checkpoint positioned at the first shard.
    #[must_use]
    pub fn new_backward(task_id: Uuid, first_shard: TimeRange) -> Self {
        Self {
            task_id,
            direction: Direction::Backward,
            current_range: first_shard,
            current_page: 1,
            completed_shards: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    /// Switch to the forward pass with the incremental cursor window.
    pub fn advance_to_forward(&mut self, window: TimeRange) {
        self.direction = Direction::Forward;
        self.current_range = window;
        self.current_page = 1;
        self.saved_at = Utc::now();
    }

    /// Record a page as persisted; the next fetch starts at `next_page`.
    pub fn record_page(&mut self, next_page: u32) {
        self.current_page = next_page;
        self.saved_at = Utc::now();
    }

    /// Record the current shard as fully persisted and reposition onto
    /// `next` (when another shard remains).
    pub fn record_completed_shard(&mut self, next: Option<TimeRange>) {
        let done = self.current_range;
        self.completed_shards.push(done);
        self.completed_shards.sort_by_key(|shard| shard.start);
        if let Some(next) = next {
            self.current_range = next;
        }
        self.current_page = 1;
        self.saved_at = Utc::now();
    }

    /// Invariant check applied after every load.
    pub fn validate(&self) -> Result<()> {
        let corrupt = |detail: String| HarvestError::CheckpointCorrupt {
            task_id: self.task_id.to_string(),
            detail,
        };

        if self.current_page < 1 {
            return Err(corrupt("current_page below 1".to_string()));
        }
        if self.current_range.start >= self.current_range.end {
            return Err(corrupt("current_range is empty or inverted".to_string()));
        }
        if !self.current_range.is_hour_aligned() {
            return Err(corrupt("current_range not hour-aligned".to_string()));
        }
        for shard in &self.completed_shards {
            if !shard.is_hour_aligned() || shard.start >= shard.end {
                return Err(corrupt(format!(
                    "completed shard [{}, {}) malformed",
                    shard.start, shard.end
                )));
            }
        }
        for pair in self.completed_shards.windows(2) {
            if pair[0].end > pair[1].start {
                return Err(corrupt(format!(
                    "completed shards overlap at {}",
                    pair[1].start
                )));
            }
        }
        Ok(())
    }

    /// Subtract the completed shards (and the current shard) from `full`,
    /// yielding the time still to plan on resume.
    #[must_use]
    pub fn uncovered(&self, full: TimeRange) -> Vec<TimeRange> {
        let mut covered: Vec<TimeRange> = self.completed_shards.clone();
        if self.direction == Direction::Backward {
            covered.push(self.current_range);
        }
        covered.sort_by_key(|shard| shard.start);

        let mut gaps = Vec::new();
        let mut cursor = full.start;
        for shard in covered {
            if shard.end <= full.start || shard.start >= full.end {
                continue;
            }
            if shard.start > cursor {
                if let Ok(gap) = TimeRange::new(cursor, shard.start) {
                    gaps.push(gap);
                }
            }
            cursor = cursor.max(shard.end);
        }
        if cursor < full.end {
            if let Ok(gap) = TimeRange::new(cursor, full.end) {
                gaps.push(gap);
            }
        }
        gaps
    }
}

const FIELD_STATE: &str = "state";
const FIELD_SAVED_AT: &str = "saved_at";

/// Redis persistence for checkpoints.
pub struct CheckpointStore {
    pool: deadpool_redis::Pool,
    namespace: String,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(pool: deadpool_redis::Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }

    fn key(&self, task_id: Uuid) -> String {
        format!("{}:crawl:ckpt:{task_id}", self.namespace)
    }

    /// Idempotent single-record write.
    pub async fn save(&self, checkpoint: &CrawlCheckpoint) -> Result<()> {
        let key = self.key(checkpoint.task_id);
        let state = serde_json::to_string(checkpoint)?;
        storage::retrying("checkpoint save", || {
            let key = key.clone();
            let state = state.clone();
            async move {
                let mut conn = self.pool.get().await?;
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .hset(&key, FIELD_STATE, &state)
                    .ignore()
                    .hset(&key, FIELD_SAVED_AT, checkpoint.saved_at.to_rfc3339())
                    .ignore();
                let _: () = pipe.query_async(&mut conn).await?;
                Ok(())
            }
        })
        .await
    }

    /// Load and validate; `Ok(None)` when no checkpoint exists yet.
    ///
    /// A present-but-undecodable checkpoint is `CheckpointCorrupt`, which
    /// the engine maps to a Failed task.
    pub async fn load(&self, task_id: Uuid) -> Result<Option<CrawlCheckpoint>> {
        let key = self.key(task_id);
        let state: Option<String> = storage::retrying("checkpoint load", || {
            let key = key.clone();
            async move {
                let mut conn = self.pool.get().await?;
                Ok(conn.hget(&key, FIELD_STATE).await?)
            }
        })
        .await?;

        let Some(state) = state else {
            return Ok(None);
        };

        let checkpoint: CrawlCheckpoint =
            serde_json::from_str(&state).map_err(|e| HarvestError::CheckpointCorrupt {
                task_id: task_id.to_string(),
                detail: e.to_string(),
            })?;
        checkpoint.validate()?;
        Ok(Some(checkpoint))
    }

    /// Remove a task's checkpoint. Idempotent.
    pub async fn delete(&self, task_id: Uuid) -> Result<()> {
        let key = self.key(task_id);
        storage::retrying("checkpoint delete", || {
            let key = key.clone();
            async move {
                let mut conn = self.pool.get().await?;
                let _: i64 = conn.del(&key).await?;
                Ok(())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap() + chrono::Duration::hours(hour)
    }

    fn range(day: u32, from: i64, to: i64) -> TimeRange {
        TimeRange::new(at(day, from), at(day, to)).unwrap()
    }

    #[test]
    fn round_trips_through_json() {
        let mut checkpoint = CrawlCheckpoint::new_backward(Uuid::new_v4(), range(1, 6, 12));
        checkpoint.record_page(13);
        checkpoint.record_completed_shard(Some(range(1, 0, 6)));

        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: CrawlCheckpoint = serde_json::from_str(&json).unwrap();
        back.validate().unwrap();
        assert_eq!(back.current_page, 1);
        assert_eq!(back.completed_shards, vec![range(1, 6, 12)]);
    }

    #[test]
    fn overlapping_shards_fail_validation() {
        let mut checkpoint = CrawlCheckpoint::new_backward(Uuid::new_v4(), range(2, 0, 6));
        checkpoint.completed_shards = vec![range(1, 0, 12), range(1, 6, 18)];
        let err = checkpoint.validate().unwrap_err();
        assert_eq!(err.code(), "CheckpointCorrupt");
    }

    #[test]
    fn unaligned_current_range_fails_validation() {
        let unaligned = TimeRange::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 30, 0).unwrap(),
            at(1, 6),
        )
        .unwrap();
        let checkpoint = CrawlCheckpoint::new_backward(Uuid::new_v4(), unaligned);
        assert!(checkpoint.validate().is_err());
    }

    #[test]
    fn uncovered_subtracts_completed_and_current() {
        let full = TimeRange::new(at(1, 0), at(2, 0)).unwrap();
        let mut checkpoint = CrawlCheckpoint::new_backward(Uuid::new_v4(), range(1, 18, 21));
        checkpoint.completed_shards = vec![range(1, 21, 24)];

        let gaps = checkpoint.uncovered(full);
        assert_eq!(gaps, vec![range(1, 0, 18)]);
    }

    #[test]
    fn uncovered_of_untouched_task_is_full_range() {
        let full = TimeRange::new(at(1, 0), at(2, 0)).unwrap();
        let mut checkpoint = CrawlCheckpoint::new_backward(Uuid::new_v4(), range(1, 23, 24));
        checkpoint.direction = Direction::Forward;
        checkpoint.completed_shards.clear();
        let gaps = checkpoint.uncovered(full);
        assert_eq!(gaps, vec![full]);
    }
}
