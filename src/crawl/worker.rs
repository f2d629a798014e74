//! Per-task crawl execution
//!
//! One cooperative worker per task. Pages are fetched strictly sequentially
//! with 1–3 s pacing; the checkpoint advances after every persisted page so
//! a resume never re-fetches stored work. Pause (and cancel, which maps to
//! pause) takes effect after the in-flight page persists.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credentials::CredentialStore;
use crate::error::{HarvestError, Result};
use crate::events::{CrawlProgress, EventBus, HarvestEvent};
use crate::posts::{CrawledPost, PostStore};
use crate::sidecar::{CookieMap, SearchPage, SidecarBridge};

use super::checkpoint::{CheckpointStore, CrawlCheckpoint, Direction};
use super::sharder::{PageProbe, TimeShard, TimeSharder};
use super::task::{CrawlTask, TaskStatus, TaskStore};
use super::time_range::TimeRange;

/// Uniform pacing between page fetches.
const PACING_MIN_MS: u64 = 1_000;
const PACING_MAX_MS: u64 = 3_000;
/// Transient page-fetch retry policy.
const PAGE_RETRIES: u32 = 3;
const RETRY_JITTER_MIN_MS: u64 = 2_000;
const RETRY_JITTER_MAX_MS: u64 = 5_000;
/// Pause after an upstream rate-limit signal.
const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(60);
/// Incremental pass cadence.
const FORWARD_INTERVAL: Duration = Duration::from_secs(60);
/// Progress emission cap (10 Hz).
const PROGRESS_MIN_GAP: Duration = Duration::from_millis(100);

/// Engine → worker control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
}

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub(super) struct WorkerDeps {
    pub bridge: Arc<SidecarBridge>,
    pub credentials: Arc<CredentialStore>,
    pub tasks: Arc<TaskStore>,
    pub checkpoints: Arc<CheckpointStore>,
    pub posts: Arc<PostStore>,
    pub bus: Arc<EventBus>,
    pub sharder: TimeSharder,
}

/// Why a pass stopped.
enum PassEnd {
    Completed,
    Paused,
    PausedWith { code: &'static str, message: String },
    Failed { code: String, message: String },
}

/// Why a shard's page loop stopped.
enum ShardEnd {
    Done,
    Interrupted(PassEnd),
}

/// Probe that reads total-page counts through the bridge, paced like any
/// other upstream query.
struct SearchProbe<'a> {
    bridge: &'a SidecarBridge,
    cookies: CookieMap,
}

impl PageProbe for SearchProbe<'_> {
    async fn total_pages(&self, keyword: &str, range: TimeRange) -> Result<u32> {
        tokio::time::sleep(pacing_delay()).await;
        let page = self.bridge.search(self.cookies.clone(), keyword, range, 1).await?;
        Ok(match page.total_pages {
            Some(total) => total,
            // No count reported: assume over the cap whenever more pages
            // exist, so the planner keeps splitting.
            None if page.has_next_page => super::sharder::PAGE_CAP + 1,
            None => 1,
        })
    }
}

pub(super) struct CrawlWorker {
    task: CrawlTask,
    deps: WorkerDeps,
    control: watch::Receiver<Control>,
    last_progress: Option<Instant>,
}

impl CrawlWorker {
    pub(super) fn new(
        task: CrawlTask,
        deps: WorkerDeps,
        control: watch::Receiver<Control>,
    ) -> Self {
        Self {
            task,
            deps,
            control,
            last_progress: None,
        }
    }

    /// Execute the task from its persisted position until completion of the
    /// forward pass never happens — the worker runs until paused or failed.
    pub(super) async fn run(mut self) {
        let task_id = self.task.task_id;

        let checkpoint = match self.deps.checkpoints.load(task_id).await {
            Ok(checkpoint) => checkpoint,
            Err(err @ HarvestError::CheckpointCorrupt { .. }) => {
                warn!(%task_id, error = %err, "checkpoint corrupt, failing task");
                self.fail(err.code().to_string(), err.to_string()).await;
                return;
            }
            Err(err) => {
                self.fail(err.code().to_string(), err.to_string()).await;
                return;
            }
        };

        let history_done = matches!(
            self.task.status,
            TaskStatus::HistoryCompleted | TaskStatus::IncrementalCrawling
        ) || checkpoint
            .as_ref()
            .is_some_and(|c| c.direction == Direction::Forward);

        let end = if history_done {
            self.forward_pass().await
        } else {
            match self.backward_pass(checkpoint).await {
                PassEnd::Completed => self.forward_pass().await,
                other => other,
            }
        };

        match end {
            PassEnd::Completed => {
                // Only reachable via engine shutdown of the forward loop.
                debug!(%task_id, "worker finished");
            }
            PassEnd::Paused => self.pause(None).await,
            PassEnd::PausedWith { code, message } => self.pause(Some((code, message))).await,
            PassEnd::Failed { code, message } => self.fail(code, message).await,
        }
    }

    // -- Backward (historical) pass ----------------------------------------

    async fn backward_pass(&mut self, checkpoint: Option<CrawlCheckpoint>) -> PassEnd {
        let task_id = self.task.task_id;

        if self.task.status != TaskStatus::HistoryCrawling {
            if let Err(err) = self.task.transition(TaskStatus::HistoryCrawling) {
                return PassEnd::Failed {
                    code: err.code().to_string(),
                    message: err.to_string(),
                };
            }
        }
        if let Err(err) = self.deps.tasks.save(&self.task).await {
            return PassEnd::Failed {
                code: err.code().to_string(),
                message: err.to_string(),
            };
        }

        let cookies = match self.load_cookies().await {
            Ok(cookies) => cookies,
            Err(end) => return end,
        };

        // Historical window: event start up to the task's creation instant.
        let full = match TimeRange::align_outward(self.task.event_start_time, self.task.created_at)
        {
            Ok(range) => range,
            Err(err) => {
                return PassEnd::Failed {
                    code: err.code().to_string(),
                    message: err.to_string(),
                };
            }
        };

        // Plan the uncovered time; a resume continues the interrupted shard
        // first, then the remaining gaps newest-first.
        let (mut checkpoint, mut shards) = match self
            .plan_backward(checkpoint, full, &cookies)
            .await
        {
            Ok(planned) => planned,
            Err(end) => return end,
        };

        info!(%task_id, shards = shards.len() + 1, "backward pass planned");

        loop {
            match self.crawl_shard(&mut checkpoint, &cookies).await {
                Ok(ShardEnd::Done) => {
                    let next = shards.pop();
                    checkpoint.record_completed_shard(next.map(|shard| shard.range));
                    if let Err(err) = self.deps.checkpoints.save(&checkpoint).await {
                        return pause_on_storage(err);
                    }
                    if next.is_none() {
                        break;
                    }
                }
                Ok(ShardEnd::Interrupted(end)) => return end,
                Err(err) => return pause_on_storage(err),
            }
        }

        if let Err(err) = self.task.transition(TaskStatus::HistoryCompleted) {
            return PassEnd::Failed {
                code: err.code().to_string(),
                message: err.to_string(),
            };
        }
        if let Err(err) = self.deps.tasks.save(&self.task).await {
            return pause_on_storage(err);
        }
        self.deps
            .bus
            .publish(HarvestEvent::crawl_completed(task_id, self.task.crawled_count));
        info!(%task_id, crawled = self.task.crawled_count, "history crawl completed");
        PassEnd::Completed
    }

    /// Build (checkpoint, remaining shards newest-first-on-pop) for the
    /// backward pass. `shards` is kept oldest-first so `pop()` yields the
    /// newest remaining shard.
    async fn plan_backward(
        &mut self,
        checkpoint: Option<CrawlCheckpoint>,
        full: TimeRange,
        cookies: &CookieMap,
    ) -> std::result::Result<(CrawlCheckpoint, Vec<TimeShard>), PassEnd> {
        let probe = SearchProbe {
            bridge: self.deps.bridge.as_ref(),
            cookies: cookies.clone(),
        };

        match checkpoint {
            Some(checkpoint) => {
                let mut shards = Vec::new();
                for gap in checkpoint.uncovered(full) {
                    match self
                        .deps
                        .sharder
                        .plan(&probe, &self.task.keyword, gap)
                        .await
                    {
                        Ok(mut planned) => shards.append(&mut planned),
                        Err(err) => return Err(map_plan_error(err)),
                    }
                }
                shards.sort_by_key(|shard| shard.range.start);
                Ok((checkpoint, shards))
            }
            None => {
                let mut shards = match self
                    .deps
                    .sharder
                    .plan(&probe, &self.task.keyword, full)
                    .await
                {
                    Ok(planned) => planned,
                    Err(err) => return Err(map_plan_error(err)),
                };
                // Newest shard first.
                let Some(first) = shards.pop() else {
                    return Err(PassEnd::Failed {
                        code: "InvalidTime".to_string(),
                        message: "empty backward plan".to_string(),
                    });
                };
                let checkpoint = CrawlCheckpoint::new_backward(self.task.task_id, first.range);
                if let Err(err) = self.deps.checkpoints.save(&checkpoint).await {
                    return Err(pause_on_storage(err));
                }
                Ok((checkpoint, shards))
            }
        }
    }

    // -- Forward (incremental) pass ----------------------------------------

    async fn forward_pass(&mut self) -> PassEnd {
        let task_id = self.task.task_id;

        if self.task.status != TaskStatus::IncrementalCrawling {
            if let Err(err) = self.task.transition(TaskStatus::IncrementalCrawling) {
                return PassEnd::Failed {
                    code: err.code().to_string(),
                    message: err.to_string(),
                };
            }
        }
        if let Err(err) = self.deps.tasks.save(&self.task).await {
            return pause_on_storage(err);
        }

        // Cursor: newest stored post, or now when nothing was stored yet.
        let mut cursor = match self.deps.posts.max_published_at(task_id).await {
            Ok(Some(newest)) => newest,
            Ok(None) => Utc::now(),
            Err(err) => return pause_on_storage(err),
        };

        info!(%task_id, %cursor, "forward pass running");

        loop {
            if self.wait_or_pause(FORWARD_INTERVAL).await {
                return PassEnd::Paused;
            }

            let cookies = match self.load_cookies().await {
                Ok(cookies) => cookies,
                Err(end) => return end,
            };

            // `now` is captured before the query so the next window overlaps
            // rather than skips; the post store absorbs the echoes.
            let now = Utc::now();
            let Ok(window) = TimeRange::align_outward(cursor, now) else {
                continue;
            };

            let mut checkpoint = CrawlCheckpoint {
                task_id,
                direction: Direction::Forward,
                current_range: window,
                current_page: 1,
                completed_shards: Vec::new(),
                saved_at: Utc::now(),
            };
            match self.deps.checkpoints.load(task_id).await {
                Ok(Some(mut existing)) => {
                    existing.advance_to_forward(window);
                    checkpoint = existing;
                }
                Ok(None) => {}
                Err(err) => return pause_on_storage(err),
            }

            match self.crawl_shard(&mut checkpoint, &cookies).await {
                Ok(ShardEnd::Done) => {
                    cursor = now;
                }
                Ok(ShardEnd::Interrupted(end)) => return end,
                Err(err) => return pause_on_storage(err),
            }
        }
    }

    // -- Shared page loop ---------------------------------------------------

    /// Page through `checkpoint.current_range` starting at
    /// `checkpoint.current_page`, persisting every page before advancing.
    async fn crawl_shard(
        &mut self,
        checkpoint: &mut CrawlCheckpoint,
        cookies: &CookieMap,
    ) -> Result<ShardEnd> {
        let task_id = self.task.task_id;
        let range = checkpoint.current_range;

        loop {
            if *self.control.borrow() == Control::Pause {
                self.deps.checkpoints.save(checkpoint).await?;
                return Ok(ShardEnd::Interrupted(PassEnd::Paused));
            }

            let page_no = checkpoint.current_page;
            let page = match self.fetch_page(cookies, range, page_no).await {
                Ok(page) => page,
                Err(end) => {
                    self.deps.checkpoints.save(checkpoint).await?;
                    return Ok(ShardEnd::Interrupted(end));
                }
            };

            let posts: Vec<CrawledPost> = page
                .posts
                .into_iter()
                .map(|raw| CrawledPost::from_raw(task_id, raw))
                .collect();
            self.deps.posts.insert_batch(task_id, &posts).await?;

            // Count from the store so the task counter always equals the
            // index cardinality, replays included.
            self.task.crawled_count = self.deps.posts.count(task_id).await?;
            self.task.updated_at = Utc::now();
            checkpoint.record_page(page_no + 1);
            self.deps.checkpoints.save(checkpoint).await?;
            self.deps.tasks.save(&self.task).await?;

            self.emit_progress(checkpoint);

            if !page.has_next_page {
                return Ok(ShardEnd::Done);
            }

            if self.wait_or_pause(pacing_delay()).await {
                self.deps.checkpoints.save(checkpoint).await?;
                return Ok(ShardEnd::Interrupted(PassEnd::Paused));
            }
        }
    }

    /// Fetch one page, absorbing transient failures (3 retries with jitter)
    /// and rate-limit pauses. CAPTCHA and exhausted retries interrupt the
    /// pass.
    async fn fetch_page(
        &mut self,
        cookies: &CookieMap,
        range: TimeRange,
        page: u32,
    ) -> std::result::Result<SearchPage, PassEnd> {
        let mut attempts: u32 = 0;
        loop {
            match self
                .deps
                .bridge
                .search(cookies.clone(), &self.task.keyword, range, page)
                .await
            {
                Ok(result) => return Ok(result),

                Err(HarvestError::CaptchaDetected) => {
                    warn!(task_id = %self.task.task_id, page, "captcha detected");
                    return Err(PassEnd::PausedWith {
                        code: "CaptchaDetected",
                        message: format!("captcha at page {page}"),
                    });
                }

                Err(HarvestError::RateLimited) => {
                    warn!(task_id = %self.task.task_id, page, "rate limited, pausing fetches");
                    if self.wait_or_pause(RATE_LIMIT_PAUSE).await {
                        return Err(PassEnd::Paused);
                    }
                }

                Err(err) if err.is_retryable() && attempts < PAGE_RETRIES => {
                    attempts += 1;
                    debug!(
                        task_id = %self.task.task_id,
                        page,
                        attempts,
                        error = %err,
                        "transient page failure, retrying"
                    );
                    if self.wait_or_pause(retry_delay()).await {
                        return Err(PassEnd::Paused);
                    }
                }

                Err(err) => {
                    return Err(PassEnd::PausedWith {
                        code: err.code(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    // -- Support ------------------------------------------------------------

    async fn load_cookies(&self) -> std::result::Result<CookieMap, PassEnd> {
        match self.deps.credentials.query(&self.task.uid).await {
            Ok(record) => Ok(record.cookies),
            Err(HarvestError::CredentialNotFound(uid)) => Err(PassEnd::PausedWith {
                code: "CredentialMissing",
                message: format!("no stored credential for uid {uid}"),
            }),
            Err(err) => Err(pause_on_storage(err)),
        }
    }

    /// Sleep, returning early (true) when a pause lands meanwhile.
    async fn wait_or_pause(&mut self, duration: Duration) -> bool {
        if *self.control.borrow() == Control::Pause {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => *self.control.borrow() == Control::Pause,
            changed = self.control.changed() => {
                changed.is_err() || *self.control.borrow() == Control::Pause
            }
        }
    }

    fn emit_progress(&mut self, checkpoint: &CrawlCheckpoint) {
        let now = Instant::now();
        if self
            .last_progress
            .is_some_and(|last| now.duration_since(last) < PROGRESS_MIN_GAP)
        {
            return;
        }
        self.last_progress = Some(now);
        self.deps
            .bus
            .publish(HarvestEvent::CrawlProgress(CrawlProgress {
                task_id: self.task.task_id,
                status: self.task.status,
                current_range: checkpoint.current_range,
                current_page: checkpoint.current_page,
                crawled_count: self.task.crawled_count,
                timestamp: Utc::now(),
            }));
    }

    async fn pause(&mut self, error: Option<(&'static str, String)>) {
        if self.task.status.can_transition_to(TaskStatus::Paused) {
            if self.task.transition(TaskStatus::Paused).is_ok() {
                if let Some((code, _)) = &error {
                    self.task.failure = Some((*code).to_string());
                }
                if let Err(err) = self.deps.tasks.save(&self.task).await {
                    warn!(task_id = %self.task.task_id, error = %err, "failed to persist pause");
                }
            }
        }
        if let Some((code, message)) = error {
            self.deps
                .bus
                .publish(HarvestEvent::crawl_error(self.task.task_id, code, message));
        }
        info!(task_id = %self.task.task_id, "task paused");
    }

    async fn fail(&mut self, code: String, message: String) {
        if self.task.status.can_transition_to(TaskStatus::Failed)
            && self.task.transition(TaskStatus::Failed).is_ok()
        {
            self.task.failure = Some(code.clone());
            if let Err(err) = self.deps.tasks.save(&self.task).await {
                warn!(task_id = %self.task.task_id, error = %err, "failed to persist failure");
            }
        }
        self.deps
            .bus
            .publish(HarvestEvent::crawl_error(self.task.task_id, &code, message));
        warn!(task_id = %self.task.task_id, code, "task failed");
    }
}

/// Storage trouble during a crawl pauses the task; the previous checkpoint
/// stays authoritative and no progress is lost.
fn pause_on_storage(err: HarvestError) -> PassEnd {
    PassEnd::PausedWith {
        code: "RedisConnectionFailed",
        message: err.to_string(),
    }
}

fn map_plan_error(err: HarvestError) -> PassEnd {
    match err {
        HarvestError::CaptchaDetected => PassEnd::PausedWith {
            code: "CaptchaDetected",
            message: "captcha during shard planning".to_string(),
        },
        other => PassEnd::PausedWith {
            code: other.code(),
            message: other.to_string(),
        },
    }
}

fn pacing_delay() -> Duration {
    Duration::from_millis(rand::rng().random_range(PACING_MIN_MS..=PACING_MAX_MS))
}

fn retry_delay() -> Duration {
    Duration::from_millis(rand::rng().random_range(RETRY_JITTER_MIN_MS..=RETRY_JITTER_MAX_MS))
}
