//! Crawl engine
//!
//! Owns the registry of running tasks. Each started task gets one
//! cooperative worker; control flows through a watch channel so pause and
//! cancel land between pages. Cancel maps to pause — the checkpoint is
//! preserved and only an explicit delete removes task state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credentials::CredentialStore;
use crate::error::{HarvestError, Result};
use crate::events::EventBus;
use crate::posts::PostStore;
use crate::sidecar::SidecarBridge;

use super::checkpoint::{CheckpointStore, CrawlCheckpoint};
use super::sharder::TimeSharder;
use super::task::{CrawlTask, SortOrder, TaskSortField, TaskStatus, TaskStore};
use super::worker::{Control, CrawlWorker, WorkerDeps};

/// Derived per-task figures for the stats RPC.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    pub crawled_count: u64,
    pub completed_shard_count: usize,
    pub oldest_post_at: Option<DateTime<Utc>>,
    pub newest_post_at: Option<DateTime<Utc>>,
}

struct RunningTask {
    control: watch::Sender<Control>,
    worker: JoinHandle<()>,
}

/// Task lifecycle owner.
pub struct CrawlEngine {
    deps: WorkerDeps,
    running: DashMap<Uuid, RunningTask>,
}

impl CrawlEngine {
    #[must_use]
    pub fn new(
        bridge: Arc<SidecarBridge>,
        credentials: Arc<CredentialStore>,
        tasks: Arc<TaskStore>,
        checkpoints: Arc<CheckpointStore>,
        posts: Arc<PostStore>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            deps: WorkerDeps {
                bridge,
                credentials,
                tasks,
                checkpoints,
                posts,
                bus,
                sharder: TimeSharder::default(),
            },
            running: DashMap::new(),
        })
    }

    /// Create and persist a task. The referenced credential must exist.
    pub async fn create_task(
        &self,
        keyword: &str,
        event_start_time: DateTime<Utc>,
        uid: &str,
    ) -> Result<CrawlTask> {
        self.deps.credentials.query(uid).await?;
        let task = CrawlTask::new(keyword, uid, event_start_time)?;
        self.deps.tasks.save(&task).await?;
        info!(task_id = %task.task_id, keyword, uid, "crawl task created");
        Ok(task)
    }

    /// Start or resume a task's worker.
    pub async fn start_task(self: &Arc<Self>, task_id: Uuid) -> Result<()> {
        if self.running.contains_key(&task_id) {
            return Err(HarvestError::InvalidStatus {
                wanted: "start",
                actual: "already running".to_string(),
            });
        }

        let task = self.deps.tasks.load(task_id).await?;
        let (control_tx, control_rx) = watch::channel(Control::Run);
        let worker = CrawlWorker::new(task, self.deps.clone(), control_rx);

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            worker.run().await;
            engine.running.remove(&task_id);
            debug!(%task_id, "worker unregistered");
        });

        self.running.insert(
            task_id,
            RunningTask {
                control: control_tx,
                worker: handle,
            },
        );
        info!(%task_id, "crawl task started");
        Ok(())
    }

    /// Request a pause. The worker finishes persisting the in-flight page,
    /// writes a fresh checkpoint, and transitions to Paused.
    pub async fn pause_task(&self, task_id: Uuid) -> Result<()> {
        if let Some(entry) = self.running.get(&task_id) {
            let _ = entry.control.send(Control::Pause);
            info!(%task_id, "pause requested");
            return Ok(());
        }

        // No in-process worker: either a stale running status from a crash,
        // or the task is simply not running.
        let mut task = self.deps.tasks.load(task_id).await?;
        if task.status.is_running() {
            task.transition(TaskStatus::Paused)?;
            self.deps.tasks.save(&task).await?;
            info!(%task_id, "stale running task marked paused");
            Ok(())
        } else {
            Err(HarvestError::InvalidStatus {
                wanted: "pause",
                actual: task.status.as_str().to_string(),
            })
        }
    }

    /// Cancel is pause by another name: state survives for a later delete.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        self.pause_task(task_id).await
    }

    /// Remove a task entirely: meta, checkpoint, and stored posts. A running
    /// worker is paused and drained first.
    pub async fn delete_task(&self, task_id: Uuid) -> Result<()> {
        // Confirms existence before destroying anything.
        let _ = self.deps.tasks.load(task_id).await?;

        if let Some((_, entry)) = self.running.remove(&task_id) {
            let _ = entry.control.send(Control::Pause);
            if let Err(e) = entry.worker.await {
                warn!(%task_id, error = %e, "worker join failed during delete");
            }
        }

        self.deps.posts.delete_all(task_id).await?;
        self.deps.checkpoints.delete(task_id).await?;
        self.deps.tasks.delete(task_id).await?;
        info!(%task_id, "crawl task deleted");
        Ok(())
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<CrawlTask> {
        self.deps.tasks.load(task_id).await
    }

    /// Checkpoint for a task; `None` when the task has not crawled yet.
    pub async fn get_checkpoint(&self, task_id: Uuid) -> Result<Option<CrawlCheckpoint>> {
        let _ = self.deps.tasks.load(task_id).await?;
        self.deps.checkpoints.load(task_id).await
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        sort_by: TaskSortField,
        order: SortOrder,
    ) -> Result<Vec<CrawlTask>> {
        self.deps.tasks.list(status, sort_by, order).await
    }

    pub async fn stats(&self, task_id: Uuid) -> Result<TaskStats> {
        let _ = self.deps.tasks.load(task_id).await?;
        let checkpoint = self.deps.checkpoints.load(task_id).await?;
        Ok(TaskStats {
            crawled_count: self.deps.posts.count(task_id).await?,
            completed_shard_count: checkpoint
                .map(|c| c.completed_shards.len())
                .unwrap_or_default(),
            oldest_post_at: self.deps.posts.min_published_at(task_id).await?,
            newest_post_at: self.deps.posts.max_published_at(task_id).await?,
        })
    }

    /// Tasks with an in-process worker right now.
    #[must_use]
    pub fn running_tasks(&self) -> Vec<Uuid> {
        self.running.iter().map(|entry| *entry.key()).collect()
    }

    /// Pause every running worker and wait for each to drain.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.running.iter().map(|entry| *entry.key()).collect();
        for task_id in ids {
            if let Some((_, entry)) = self.running.remove(&task_id) {
                let _ = entry.control.send(Control::Pause);
                if let Err(e) = entry.worker.await {
                    warn!(%task_id, error = %e, "worker join failed during shutdown");
                }
            }
        }
        info!("crawl engine drained");
    }
}
