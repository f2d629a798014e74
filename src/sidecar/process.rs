//! Sidecar subprocess lifecycle
//!
//! Owns the browser-automation subprocess: spawn from the configured
//! launcher, forward its stdout/stderr into the log sink tagged with the
//! PID, poll the local health endpoint, and kill + restart after three
//! consecutive health failures.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HarvesterConfig;
use crate::error::{HarvestError, Result};

/// Health probe timeout and poll cadence.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_INTERVAL: Duration = Duration::from_secs(10);
/// Consecutive failures before the subprocess is recycled.
const MAX_HEALTH_FAILURES: u32 = 3;
/// Lines of subprocess output retained for the logs RPC.
const LOG_RING_CAPACITY: usize = 500;

/// Handle to the sidecar subprocess.
#[derive(Debug)]
pub struct SidecarProcess {
    command: String,
    args: Vec<String>,
    health_url: String,
    http: reqwest::Client,
    child: Mutex<Option<Child>>,
    recent_logs: Arc<parking_lot::Mutex<VecDeque<String>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl SidecarProcess {
    #[must_use]
    pub fn new(config: &HarvesterConfig) -> Arc<Self> {
        Arc::new(Self {
            command: config.sidecar_command.clone(),
            args: config.sidecar_args.clone(),
            health_url: config.sidecar_health_url.clone(),
            http: reqwest::Client::new(),
            child: Mutex::new(None),
            recent_logs: Arc::new(parking_lot::Mutex::new(VecDeque::with_capacity(
                LOG_RING_CAPACITY,
            ))),
            monitor: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Spawn the subprocess and the health monitor. Idempotent while a
    /// child is already running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.shutdown.store(false, Ordering::Relaxed);

        {
            let mut child_slot = self.child.lock().await;
            if child_slot.is_some() {
                debug!("sidecar already running, start is a no-op");
                return Ok(());
            }
            *child_slot = Some(self.spawn_child().await?);
        }

        let mut monitor_slot = self.monitor.lock().await;
        if monitor_slot.is_none() {
            let process = Arc::clone(self);
            *monitor_slot = Some(tokio::spawn(async move {
                health_loop(process).await;
            }));
        }

        Ok(())
    }

    /// Stop the monitor and kill the subprocess.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(handle) = self.monitor.lock().await.take() {
            handle.abort();
        }

        if let Some(mut child) = self.child.lock().await.take() {
            let pid = child.id();
            if let Err(e) = child.kill().await {
                warn!(?pid, error = %e, "failed to kill sidecar");
            } else {
                info!(?pid, "sidecar stopped");
            }
        }
        Ok(())
    }

    /// One-shot health probe against the local endpoint.
    pub async fn health(&self) -> bool {
        let request = self.http.get(&self.health_url).timeout(HEALTH_TIMEOUT);
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "sidecar health probe failed");
                false
            }
        }
    }

    /// Whether a child process is currently held.
    pub async fn is_running(&self) -> bool {
        self.child.lock().await.is_some()
    }

    /// PID of the running subprocess, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|child| child.id())
    }

    /// Most recent subprocess output lines, oldest first.
    #[must_use]
    pub fn recent_logs(&self, limit: usize) -> Vec<String> {
        let ring = self.recent_logs.lock();
        ring.iter()
            .skip(ring.len().saturating_sub(limit))
            .cloned()
            .collect()
    }

    async fn spawn_child(self: &Arc<Self>) -> Result<Child> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HarvestError::SidecarUnavailable(format!("spawn {}: {e}", self.command))
            })?;

        let pid = child.id();
        info!(?pid, command = %self.command, "sidecar spawned");

        if let Some(stdout) = child.stdout.take() {
            self.forward_output(stdout, "stdout", pid);
        }
        if let Some(stderr) = child.stderr.take() {
            self.forward_output(stderr, "stderr", pid);
        }

        Ok(child)
    }

    fn forward_output<R>(&self, reader: R, stream: &'static str, pid: Option<u32>)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let ring = Arc::clone(&self.recent_logs);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(?pid, stream, "{line}");
                let mut ring = ring.lock();
                if ring.len() == LOG_RING_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(format!("[{}:{stream}] {line}", pid.unwrap_or(0)));
            }
        });
    }

    /// Kill the current child (if any) and spawn a replacement.
    async fn restart(self: &Arc<Self>) -> Result<()> {
        let mut child_slot = self.child.lock().await;
        if let Some(mut old) = child_slot.take() {
            let pid = old.id();
            warn!(?pid, "recycling unhealthy sidecar");
            let _ = old.kill().await;
        }
        *child_slot = Some(self.spawn_child().await?);
        Ok(())
    }
}

/// Background monitor: poll health, recycle after three straight failures.
async fn health_loop(process: Arc<SidecarProcess>) {
    let mut interval = tokio::time::interval(HEALTH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failures: u32 = 0;

    loop {
        interval.tick().await;
        if process.shutdown.load(Ordering::Relaxed) {
            break;
        }
        if !process.is_running().await {
            continue;
        }

        if process.health().await {
            if failures > 0 {
                debug!(failures, "sidecar health recovered");
            }
            failures = 0;
            continue;
        }

        failures += 1;
        warn!(failures, "sidecar health check failed");
        if failures >= MAX_HEALTH_FAILURES {
            failures = 0;
            if let Err(e) = process.restart().await {
                warn!(error = %e, "sidecar restart failed, will retry next cycle");
            }
        }
    }

    debug!("sidecar health loop exiting");
}
