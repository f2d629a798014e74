//! Back-end RPC surface
//!
//! `AppContext` wires every component together once at startup and exposes
//! the named procedures the desktop shell invokes. The transport that calls
//! them is out of scope; every operation here is a plain async method with
//! serializable inputs and outputs, and all capabilities are injected — no
//! ambient globals.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::HarvesterConfig;
use crate::crawl::{
    CheckpointStore, CrawlCheckpoint, CrawlEngine, CrawlTask, SortOrder, TaskSortField,
    TaskStats, TaskStatus, TaskStore,
};
use crate::credentials::{CredentialRecord, CredentialStore, CredentialValidator};
use crate::error::Result;
use crate::events::EventBus;
use crate::export::{self, ExportFormat, ExportReceipt};
use crate::login::{LoginOrchestrator, PollStatus, QrCodeIssued};
use crate::posts::PostStore;
use crate::sidecar::{CookieMap, SidecarBridge};
use crate::storage;

/// Result of `save_cookies`.
#[derive(Debug, Clone, Serialize)]
pub struct SaveCookiesResponse {
    pub success: bool,
    pub key: String,
    pub validation_duration_ms: u64,
    pub is_overwrite: bool,
}

/// Result of `create_crawl_task`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Result of `list_crawl_tasks`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<CrawlTask>,
    pub total: usize,
}

/// Parameters of `list_crawl_tasks`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTasksRequest {
    pub status: Option<TaskStatus>,
    pub sort_by: Option<TaskSortField>,
    pub sort_order: Option<SortOrder>,
}

/// Result of the sidecar status RPC.
#[derive(Debug, Clone, Serialize)]
pub struct SidecarStatus {
    pub running: bool,
    pub healthy: bool,
    pub pid: Option<u32>,
}

/// Everything the RPC layer needs, built once at startup.
pub struct AppContext {
    config: HarvesterConfig,
    bus: Arc<EventBus>,
    bridge: Arc<SidecarBridge>,
    credentials: Arc<CredentialStore>,
    validator: Arc<CredentialValidator>,
    login: Arc<LoginOrchestrator>,
    engine: Arc<CrawlEngine>,
    posts: Arc<PostStore>,
}

impl AppContext {
    /// Construct the component graph. Does not start the sidecar; that is
    /// an explicit operation (or the binary's startup sequence).
    pub fn initialize(config: HarvesterConfig) -> Result<Self> {
        config.validate()?;
        let pool = storage::create_pool(&config)?;
        let namespace = config.namespace.clone();

        let bus = Arc::new(EventBus::default());
        let bridge = SidecarBridge::new(&config, Arc::clone(&bus));
        let credentials = Arc::new(CredentialStore::new(pool.clone(), namespace.clone()));
        let validator = Arc::new(CredentialValidator::new(Arc::clone(&bridge)));
        let login = LoginOrchestrator::new(
            Arc::clone(&bridge),
            Arc::clone(&validator),
            Arc::clone(&credentials),
            Arc::clone(&bus),
        );

        let tasks = Arc::new(TaskStore::new(pool.clone(), namespace.clone()));
        let checkpoints = Arc::new(CheckpointStore::new(pool.clone(), namespace.clone()));
        let posts = Arc::new(PostStore::new(pool, namespace));
        let engine = CrawlEngine::new(
            Arc::clone(&bridge),
            Arc::clone(&credentials),
            tasks,
            checkpoints,
            Arc::clone(&posts),
            Arc::clone(&bus),
        );

        Ok(Self {
            config,
            bus,
            bridge,
            credentials,
            validator,
            login,
            engine,
            posts,
        })
    }

    /// Event bus handle for the front-end consumer.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[must_use]
    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    /// Drain workers and stop the sidecar.
    pub async fn shutdown(&self) -> Result<()> {
        self.engine.shutdown().await;
        self.bridge.stop().await
    }

    // -- Login --------------------------------------------------------------

    pub async fn generate_qrcode(&self) -> Result<QrCodeIssued> {
        self.login.open_login().await
    }

    pub async fn poll_login_status(&self, qr_id: &str) -> Result<PollStatus> {
        self.login.poll(qr_id).await
    }

    pub async fn cancel_login(&self, qr_id: &str) -> Result<()> {
        self.login.cancel(qr_id).await
    }

    // -- Credentials --------------------------------------------------------

    /// Validate-then-persist a cookie set supplied by the front end. The
    /// expected uid cross-check guards against saving under the wrong
    /// account.
    pub async fn save_cookies(
        &self,
        uid: &str,
        cookies: CookieMap,
        display_name: Option<String>,
    ) -> Result<SaveCookiesResponse> {
        let started = Instant::now();
        let identity = self.validator.validate(&cookies, Some(uid)).await?;
        let validation_duration_ms = started.elapsed().as_millis() as u64;

        let record = CredentialRecord::new(
            identity.uid,
            cookies,
            Utc::now(),
            identity.display_name.or(display_name),
        );
        let receipt = self.credentials.save(&record).await?;

        Ok(SaveCookiesResponse {
            success: true,
            key: receipt.key,
            validation_duration_ms,
            is_overwrite: receipt.outcome == crate::credentials::SaveOutcome::Overwritten,
        })
    }

    pub async fn query_cookies(&self, uid: &str) -> Result<CredentialRecord> {
        self.credentials.query(uid).await
    }

    pub async fn delete_cookies(&self, uid: &str) -> Result<()> {
        self.credentials.delete(uid).await
    }

    pub async fn list_all_uids(&self) -> Result<Vec<String>> {
        self.credentials.list().await
    }

    // -- Crawling -----------------------------------------------------------

    pub async fn create_crawl_task(
        &self,
        keyword: &str,
        event_start_time: DateTime<Utc>,
        uid: &str,
    ) -> Result<CreateTaskResponse> {
        let task = self.engine.create_task(keyword, event_start_time, uid).await?;
        Ok(CreateTaskResponse {
            task_id: task.task_id,
            created_at: task.created_at,
        })
    }

    pub async fn start_crawl(&self, task_id: Uuid) -> Result<()> {
        self.engine.start_task(task_id).await
    }

    pub async fn pause_crawl(&self, task_id: Uuid) -> Result<()> {
        self.engine.pause_task(task_id).await
    }

    pub async fn cancel_crawl(&self, task_id: Uuid) -> Result<()> {
        self.engine.cancel_task(task_id).await
    }

    pub async fn delete_crawl_task(&self, task_id: Uuid) -> Result<()> {
        self.engine.delete_task(task_id).await
    }

    pub async fn get_crawl_task(&self, task_id: Uuid) -> Result<CrawlTask> {
        self.engine.get_task(task_id).await
    }

    pub async fn get_crawl_checkpoint(&self, task_id: Uuid) -> Result<Option<CrawlCheckpoint>> {
        self.engine.get_checkpoint(task_id).await
    }

    pub async fn get_crawl_stats(&self, task_id: Uuid) -> Result<TaskStats> {
        self.engine.stats(task_id).await
    }

    pub async fn list_crawl_tasks(&self, request: ListTasksRequest) -> Result<TaskListResponse> {
        let tasks = self
            .engine
            .list_tasks(
                request.status,
                request.sort_by.unwrap_or_default(),
                request.sort_order.unwrap_or_default(),
            )
            .await?;
        let total = tasks.len();
        Ok(TaskListResponse { tasks, total })
    }

    pub async fn export_crawl_data(
        &self,
        task_id: Uuid,
        format: ExportFormat,
        time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<ExportReceipt> {
        let task = self.engine.get_task(task_id).await?;
        export::export_task(&self.posts, &task, &self.config.export_dir, format, time_range).await
    }

    // -- Sidecar ------------------------------------------------------------

    pub async fn start_playwright_server(&self) -> Result<()> {
        self.bridge.start().await
    }

    pub async fn stop_playwright_server(&self) -> Result<()> {
        self.bridge.stop().await
    }

    pub async fn check_playwright_server(&self) -> SidecarStatus {
        let process = self.bridge.process();
        SidecarStatus {
            running: process.is_running().await,
            healthy: self.bridge.health().await,
            pid: process.pid().await,
        }
    }

    #[must_use]
    pub fn get_playwright_logs(&self, limit: usize) -> Vec<String> {
        self.bridge.process().recent_logs(limit)
    }

    /// Export directory currently in effect.
    #[must_use]
    pub fn export_dir(&self) -> &PathBuf {
        &self.config.export_dir
    }
}
