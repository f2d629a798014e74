//! Crawl task model and persistence
//!
//! Task metadata lives in one Redis hash per task under
//! `<ns>:crawl:task:<task_id>`. The status machine is enforced here; the
//! engine only ever moves a task through [`CrawlTask::transition`].

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{HarvestError, Result};
use crate::storage;

/// Lifecycle states of a crawl task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    HistoryCrawling,
    HistoryCompleted,
    IncrementalCrawling,
    Paused,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, Self::HistoryCrawling | Self::IncrementalCrawling)
    }

    /// Legal edges of the status machine.
    #[must_use]
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::{
            Created, Failed, HistoryCompleted, HistoryCrawling, IncrementalCrawling, Paused,
        };
        match (self, next) {
            (Created, HistoryCrawling) => true,
            (HistoryCrawling, HistoryCompleted | Paused | Failed) => true,
            (HistoryCompleted, IncrementalCrawling | Paused | Failed) => true,
            (IncrementalCrawling, Paused | Failed) => true,
            // Re-entry after user action.
            (Paused | Failed, HistoryCrawling | IncrementalCrawling) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::HistoryCrawling => "history_crawling",
            Self::HistoryCompleted => "history_completed",
            Self::IncrementalCrawling => "incremental_crawling",
            Self::Paused => "paused",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "history_crawling" => Ok(Self::HistoryCrawling),
            "history_completed" => Ok(Self::HistoryCompleted),
            "incremental_crawling" => Ok(Self::IncrementalCrawling),
            "paused" => Ok(Self::Paused),
            "failed" => Ok(Self::Failed),
            other => Err(HarvestError::Serialization(format!(
                "unknown task status {other}"
            ))),
        }
    }
}

/// One keyword crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlTask {
    pub task_id: Uuid,
    pub keyword: String,
    /// Account whose credentials drive the crawl
    pub uid: String,
    /// Earliest wall-clock instant the backward pass must reach
    pub event_start_time: DateTime<Utc>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub crawled_count: u64,
    /// Failure code when `status == Failed`
    pub failure: Option<String>,
}

impl CrawlTask {
    /// Create a task, validating keyword and start time.
    pub fn new(
        keyword: impl Into<String>,
        uid: impl Into<String>,
        event_start_time: DateTime<Utc>,
    ) -> Result<Self> {
        let keyword = keyword.into();
        if keyword.trim().is_empty() {
            return Err(HarvestError::InvalidKeyword(
                "keyword must be non-empty".to_string(),
            ));
        }
        let now = Utc::now();
        if event_start_time >= now {
            return Err(HarvestError::InvalidTime(format!(
                "event_start_time {event_start_time} must be strictly in the past"
            )));
        }
        Ok(Self {
            task_id: Uuid::new_v4(),
            keyword,
            uid: uid.into(),
            event_start_time,
            status: TaskStatus::Created,
            created_at: now,
            updated_at: now,
            crawled_count: 0,
            failure: None,
        })
    }

    /// Move to `next`, rejecting illegal edges.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(HarvestError::InvalidStatus {
                wanted: next.as_str(),
                actual: self.status.as_str().to_string(),
            });
        }
        self.status = next;
        if next != TaskStatus::Failed {
            self.failure = None;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Sorting options for task listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskSortField {
    #[default]
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

const FIELD_KEYWORD: &str = "keyword";
const FIELD_UID: &str = "uid";
const FIELD_EVENT_START: &str = "event_start_time";
const FIELD_STATUS: &str = "status";
const FIELD_CREATED_AT: &str = "created_at";
const FIELD_UPDATED_AT: &str = "updated_at";
const FIELD_CRAWLED_COUNT: &str = "crawled_count";
const FIELD_FAILURE: &str = "failure";

/// Redis persistence for task metadata.
pub struct TaskStore {
    pool: deadpool_redis::Pool,
    namespace: String,
}

impl TaskStore {
    #[must_use]
    pub fn new(pool: deadpool_redis::Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }

    fn key(&self, task_id: Uuid) -> String {
        format!("{}:crawl:task:{task_id}", self.namespace)
    }

    fn key_prefix(&self) -> String {
        format!("{}:crawl:task:", self.namespace)
    }

    /// Write the full task hash. Idempotent single-record update.
    pub async fn save(&self, task: &CrawlTask) -> Result<()> {
        let key = self.key(task.task_id);
        storage::retrying("task save", || {
            let key = key.clone();
            async move {
                let mut conn = self.pool.get().await?;
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .hset(&key, FIELD_KEYWORD, &task.keyword)
                    .ignore()
                    .hset(&key, FIELD_UID, &task.uid)
                    .ignore()
                    .hset(&key, FIELD_EVENT_START, task.event_start_time.to_rfc3339())
                    .ignore()
                    .hset(&key, FIELD_STATUS, task.status.as_str())
                    .ignore()
                    .hset(&key, FIELD_CREATED_AT, task.created_at.to_rfc3339())
                    .ignore()
                    .hset(&key, FIELD_UPDATED_AT, task.updated_at.to_rfc3339())
                    .ignore()
                    .hset(&key, FIELD_CRAWLED_COUNT, task.crawled_count)
                    .ignore()
                    .hset(&key, FIELD_FAILURE, task.failure.as_deref().unwrap_or(""))
                    .ignore();
                let _: () = pipe.query_async(&mut conn).await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn load(&self, task_id: Uuid) -> Result<CrawlTask> {
        let key = self.key(task_id);
        let fields: Vec<(String, String)> = storage::retrying("task load", || {
            let key = key.clone();
            async move {
                let mut conn = self.pool.get().await?;
                Ok(conn.hgetall(&key).await?)
            }
        })
        .await?;

        if fields.is_empty() {
            return Err(HarvestError::TaskNotFound(task_id.to_string()));
        }
        parse_task(task_id, &key, fields)
    }

    /// Every persisted task id.
    pub async fn list_ids(&self) -> Result<Vec<Uuid>> {
        let prefix = self.key_prefix();
        let pattern = format!("{prefix}*");

        let keys: Vec<String> = storage::retrying("task list", || {
            let pattern = pattern.clone();
            async move {
                let mut conn = self.pool.get().await?;
                let mut iter = conn.scan_match::<_, String>(&pattern).await?;
                let mut keys = Vec::new();
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                Ok(keys)
            }
        })
        .await?;

        Ok(keys
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(&prefix)
                    .and_then(|id| Uuid::parse_str(id).ok())
            })
            .collect())
    }

    /// Load all tasks, optionally filtered by status, sorted as requested.
    pub async fn list(
        &self,
        status: Option<TaskStatus>,
        sort_by: TaskSortField,
        order: SortOrder,
    ) -> Result<Vec<CrawlTask>> {
        let mut tasks = Vec::new();
        for task_id in self.list_ids().await? {
            match self.load(task_id).await {
                Ok(task) => {
                    if status.is_none_or(|wanted| task.status == wanted) {
                        tasks.push(task);
                    }
                }
                // Raced with a delete.
                Err(HarvestError::TaskNotFound(_)) => {}
                Err(other) => return Err(other),
            }
        }

        tasks.sort_by_key(|task| match sort_by {
            TaskSortField::CreatedAt => task.created_at,
            TaskSortField::UpdatedAt => task.updated_at,
        });
        if order == SortOrder::Desc {
            tasks.reverse();
        }
        Ok(tasks)
    }

    /// Remove the task hash. Idempotent.
    pub async fn delete(&self, task_id: Uuid) -> Result<()> {
        let key = self.key(task_id);
        storage::retrying("task delete", || {
            let key = key.clone();
            async move {
                let mut conn = self.pool.get().await?;
                let _: i64 = conn.del(&key).await?;
                Ok(())
            }
        })
        .await?;
        info!(%task_id, "task meta deleted");
        Ok(())
    }
}

fn parse_task(task_id: Uuid, key: &str, fields: Vec<(String, String)>) -> Result<CrawlTask> {
    let mut map: std::collections::BTreeMap<String, String> = fields.into_iter().collect();
    let take = |map: &mut std::collections::BTreeMap<String, String>, field: &str| {
        map.remove(field)
            .ok_or_else(|| HarvestError::Serialization(format!("task {key} missing {field}")))
    };

    let parse_time = |raw: String, field: &str| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| HarvestError::Serialization(format!("task {key} field {field}: {e}")))
    };

    let status: TaskStatus = take(&mut map, FIELD_STATUS)?.parse()?;
    let failure = map.remove(FIELD_FAILURE).filter(|s| !s.is_empty());

    Ok(CrawlTask {
        task_id,
        keyword: take(&mut map, FIELD_KEYWORD)?,
        uid: take(&mut map, FIELD_UID)?,
        event_start_time: parse_time(take(&mut map, FIELD_EVENT_START)?, FIELD_EVENT_START)?,
        status,
        created_at: parse_time(take(&mut map, FIELD_CREATED_AT)?, FIELD_CREATED_AT)?,
        updated_at: parse_time(take(&mut map, FIELD_UPDATED_AT)?, FIELD_UPDATED_AT)?,
        crawled_count: take(&mut map, FIELD_CRAWLED_COUNT)?
            .parse()
            .map_err(|e| HarvestError::Serialization(format!("task {key} crawled_count: {e}")))?,
        failure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_task_requires_past_start() {
        let err = CrawlTask::new("kw", "42", Utc::now() + Duration::hours(1)).unwrap_err();
        assert_eq!(err.code(), "InvalidTime");
    }

    #[test]
    fn new_task_requires_keyword() {
        let err = CrawlTask::new("   ", "42", Utc::now() - Duration::hours(1)).unwrap_err();
        assert_eq!(err.code(), "InvalidKeyword");
    }

    #[test]
    fn status_machine_walks_forward() {
        let mut task = CrawlTask::new("kw", "42", Utc::now() - Duration::hours(72)).unwrap();
        task.transition(TaskStatus::HistoryCrawling).unwrap();
        task.transition(TaskStatus::HistoryCompleted).unwrap();
        task.transition(TaskStatus::IncrementalCrawling).unwrap();
        task.transition(TaskStatus::Paused).unwrap();
        task.transition(TaskStatus::IncrementalCrawling).unwrap();
    }

    #[test]
    fn created_cannot_jump_to_incremental() {
        let mut task = CrawlTask::new("kw", "42", Utc::now() - Duration::hours(1)).unwrap();
        let err = task.transition(TaskStatus::IncrementalCrawling).unwrap_err();
        assert_eq!(err.code(), "InvalidStatus");
    }

    #[test]
    fn failed_task_can_resume() {
        let mut task = CrawlTask::new("kw", "42", Utc::now() - Duration::hours(1)).unwrap();
        task.transition(TaskStatus::HistoryCrawling).unwrap();
        task.transition(TaskStatus::Failed).unwrap();
        task.failure = Some("CaptchaDetected".into());
        task.transition(TaskStatus::HistoryCrawling).unwrap();
        assert!(task.failure.is_none());
    }
}
