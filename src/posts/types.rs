//! Crawled post model

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sidecar::RawPost;

/// One deduplicated post inside a task's time index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawledPost {
    /// Opaque upstream identifier, unique within the task
    pub post_id: String,
    pub task_id: Uuid,
    pub published_at: DateTime<Utc>,
    pub content: String,
    pub author: String,
    /// Side metadata carried through verbatim
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CrawledPost {
    /// Adopt a sidecar search result into a task's scope.
    #[must_use]
    pub fn from_raw(task_id: Uuid, raw: RawPost) -> Self {
        let published_at = Utc
            .timestamp_opt(raw.published_at, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            post_id: raw.id,
            task_id,
            published_at,
            content: raw.content,
            author: raw.author,
            extra: raw.extra,
        }
    }
}
