//! Time-indexed post persistence
//!
//! Per task: an ordered set `<ns>:crawl:posts:<task_id>` scoring post ids by
//! publish time, plus one body key per post. Inserts pipeline `ZADD NX` with
//! a conditional body `SET`, so replaying a batch is a no-op and the member
//! set is the single source of truth for deduplication and counting.

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use tracing::debug;
use uuid::Uuid;

use crate::error::{HarvestError, Result};
use crate::storage;

use super::types::CrawledPost;

/// Body keys deleted per pipeline round during `delete_all`.
const DELETE_CHUNK: usize = 512;

/// Outcome of one batch insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertReceipt {
    pub inserted: u64,
    pub skipped_duplicates: u64,
}

/// Post store over the shared Redis pool.
pub struct PostStore {
    pool: deadpool_redis::Pool,
    namespace: String,
}

impl PostStore {
    #[must_use]
    pub fn new(pool: deadpool_redis::Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }

    fn index_key(&self, task_id: Uuid) -> String {
        format!("{}:crawl:posts:{task_id}", self.namespace)
    }

    fn body_key(&self, task_id: Uuid, post_id: &str) -> String {
        format!("{}:crawl:post:{task_id}:{post_id}", self.namespace)
    }

    /// Insert a batch atomically, deduplicating by post id.
    pub async fn insert_batch(
        &self,
        task_id: Uuid,
        posts: &[CrawledPost],
    ) -> Result<InsertReceipt> {
        if posts.is_empty() {
            return Ok(InsertReceipt {
                inserted: 0,
                skipped_duplicates: 0,
            });
        }

        let index_key = self.index_key(task_id);
        let mut bodies = Vec::with_capacity(posts.len());
        for post in posts {
            bodies.push((
                self.body_key(task_id, &post.post_id),
                serde_json::to_string(post)?,
            ));
        }

        let added: Vec<i64> = storage::retrying("post insert_batch", || {
            let index_key = index_key.clone();
            let bodies = bodies.clone();
            async move {
                let mut conn = self.pool.get().await?;
                let mut pipe = redis::pipe();
                pipe.atomic();
                for (post, (body_key, body)) in posts.iter().zip(&bodies) {
                    pipe.cmd("ZADD")
                        .arg(&index_key)
                        .arg("NX")
                        .arg(post.published_at.timestamp())
                        .arg(&post.post_id);
                    pipe.cmd("SET").arg(body_key).arg(body).arg("NX").ignore();
                }
                Ok(pipe.query_async(&mut conn).await?)
            }
        })
        .await?;

        let inserted: u64 = added.iter().map(|n| *n as u64).sum();
        let receipt = InsertReceipt {
            inserted,
            skipped_duplicates: posts.len() as u64 - inserted,
        };
        debug!(
            %task_id,
            inserted = receipt.inserted,
            skipped = receipt.skipped_duplicates,
            "post batch persisted"
        );
        Ok(receipt)
    }

    /// Posts within `[from, to]`, ordered by publish time.
    pub async fn range(
        &self,
        task_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CrawledPost>> {
        let index_key = self.index_key(task_id);
        let ids: Vec<String> = storage::retrying("post range", || {
            let index_key = index_key.clone();
            async move {
                let mut conn = self.pool.get().await?;
                Ok(conn
                    .zrangebyscore(&index_key, from.timestamp(), to.timestamp())
                    .await?)
            }
        })
        .await?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let body_keys: Vec<String> = ids
            .iter()
            .map(|post_id| self.body_key(task_id, post_id))
            .collect();

        let bodies: Vec<Option<String>> = storage::retrying("post bodies", || {
            let body_keys = body_keys.clone();
            async move {
                let mut conn = self.pool.get().await?;
                Ok(conn.mget(&body_keys).await?)
            }
        })
        .await?;

        let mut posts = Vec::with_capacity(bodies.len());
        for (post_id, body) in ids.into_iter().zip(bodies) {
            let Some(body) = body else {
                // Index/body mismatch; the member alone still dedups.
                debug!(%task_id, post_id, "post body missing, skipping");
                continue;
            };
            posts.push(serde_json::from_str(&body).map_err(|e| {
                HarvestError::Serialization(format!("post {post_id} body: {e}"))
            })?);
        }
        Ok(posts)
    }

    /// Cardinality of the task's ordered set.
    pub async fn count(&self, task_id: Uuid) -> Result<u64> {
        let index_key = self.index_key(task_id);
        storage::retrying("post count", || {
            let index_key = index_key.clone();
            async move {
                let mut conn = self.pool.get().await?;
                Ok(conn.zcard(&index_key).await?)
            }
        })
        .await
    }

    /// Latest publish time seen for the task, if any.
    pub async fn max_published_at(&self, task_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let index_key = self.index_key(task_id);
        let newest: Vec<(String, i64)> = storage::retrying("post max_published_at", || {
            let index_key = index_key.clone();
            async move {
                let mut conn = self.pool.get().await?;
                Ok(conn.zrevrange_withscores(&index_key, 0, 0).await?)
            }
        })
        .await?;

        Ok(newest.first().and_then(|(_, score)| {
            chrono::TimeZone::timestamp_opt(&Utc, *score, 0).single()
        }))
    }

    /// Earliest publish time seen for the task, if any.
    pub async fn min_published_at(&self, task_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let index_key = self.index_key(task_id);
        let oldest: Vec<(String, i64)> = storage::retrying("post min_published_at", || {
            let index_key = index_key.clone();
            async move {
                let mut conn = self.pool.get().await?;
                Ok(conn.zrange_withscores(&index_key, 0, 0).await?)
            }
        })
        .await?;

        Ok(oldest.first().and_then(|(_, score)| {
            chrono::TimeZone::timestamp_opt(&Utc, *score, 0).single()
        }))
    }

    /// Remove the index and every body for the task.
    pub async fn delete_all(&self, task_id: Uuid) -> Result<()> {
        let index_key = self.index_key(task_id);
        let ids: Vec<String> = storage::retrying("post delete scan", || {
            let index_key = index_key.clone();
            async move {
                let mut conn = self.pool.get().await?;
                Ok(conn.zrange(&index_key, 0, -1).await?)
            }
        })
        .await?;

        for chunk in ids.chunks(DELETE_CHUNK) {
            let body_keys: Vec<String> = chunk
                .iter()
                .map(|post_id| self.body_key(task_id, post_id))
                .collect();
            storage::retrying("post delete bodies", || {
                let body_keys = body_keys.clone();
                async move {
                    let mut conn = self.pool.get().await?;
                    let _: i64 = conn.del(&body_keys).await?;
                    Ok(())
                }
            })
            .await?;
        }

        storage::retrying("post delete index", || {
            let index_key = index_key.clone();
            async move {
                let mut conn = self.pool.get().await?;
                let _: i64 = conn.del(&index_key).await?;
                Ok(())
            }
        })
        .await?;

        debug!(%task_id, removed = ids.len(), "post store cleared");
        Ok(())
    }
}
