//! WebSocket control channel to the sidecar
//!
//! One connection, shared by every caller. Writes are serialized through an
//! internal queue; reads are decoded and fanned out to per-session
//! subscribers keyed by `session_id`. Request/response calls correlate on a
//! generated id carried in the envelope's `session_id` slot.
//!
//! Liveness: a ping every 10 s, with any inbound traffic counting as life.
//! Two missed pongs drop the connection. Drops trigger up to five reconnect
//! attempts with 2/4/8/16/30 s backoff; session identifiers survive because
//! the sidecar keeps server-side session state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::error::{HarvestError, Result};
use crate::events::{EventBus, HarvestEvent};

use super::protocol::{self, InboundFrame, InboundMessage, SidecarRequest};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PING_INTERVAL: Duration = Duration::from_secs(10);
/// Two missed pings.
const STALE_AFTER: Duration = Duration::from_secs(25);
const RECONNECT_BACKOFF_SECS: [u64; 5] = [2, 4, 8, 16, 30];
const OUTBOUND_QUEUE: usize = 256;

/// Why one connection ended.
enum ConnectionEnd {
    Shutdown,
    Dropped,
    Stale,
}

/// Shared control channel handle.
pub struct WsChannel {
    url: String,
    bus: Arc<EventBus>,
    outbound_tx: mpsc::Sender<String>,
    /// Receiver side of the write queue, handed to the supervisor on start
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    /// Long-lived session subscribers (QR login sessions)
    subscribers: Arc<DashMap<String, mpsc::UnboundedSender<InboundFrame>>>,
    /// One-shot request correlations (validate / search)
    pending: Arc<DashMap<String, oneshot::Sender<InboundMessage>>>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    /// Wakes the supervisor when there is work for an idle channel
    demand: Arc<Notify>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WsChannel {
    #[must_use]
    pub fn new(url: impl Into<String>, bus: Arc<EventBus>) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        Arc::new(Self {
            url: url.into(),
            bus,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            subscribers: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            demand: Arc::new(Notify::new()),
            supervisor: Mutex::new(None),
        })
    }

    /// Start the connection supervisor. Connects lazily on first demand.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.supervisor.lock().await;
        if slot.is_some() {
            return;
        }
        let Some(outbound_rx) = self.outbound_rx.lock().await.take() else {
            return;
        };
        self.shutdown.store(false, Ordering::Relaxed);
        let channel = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            supervisor_loop(channel, outbound_rx).await;
        }));
    }

    /// Stop the supervisor and drop the connection. The channel can be
    /// started again afterwards; the write queue survives.
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.demand.notify_waiters();
        if let Some(handle) = self.supervisor.lock().await.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "channel supervisor ended abnormally");
                }
            }
        }
        self.connected.store(false, Ordering::Relaxed);
        self.fail_pending();
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Register a long-lived subscriber for frames scoped to `session_id`.
    #[must_use]
    pub fn subscribe_session(&self, session_id: &str) -> mpsc::UnboundedReceiver<InboundFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(session_id.to_string(), tx);
        self.demand.notify_one();
        rx
    }

    pub fn unsubscribe_session(&self, session_id: &str) {
        self.subscribers.remove(session_id);
    }

    /// Enqueue one already-encoded frame for the writer.
    pub async fn send_raw(&self, frame: String) -> Result<()> {
        self.demand.notify_one();
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| HarvestError::ConnectionLost { fatal: true })
    }

    /// Issue a request and await its correlated response.
    pub async fn request(
        &self,
        request: SidecarRequest,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<InboundMessage> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let frame = request.encode(&correlation_id)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);

        if let Err(e) = self.send_raw(frame).await {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => {
                // Sender dropped: connection was declared fatally lost.
                Err(HarvestError::NetworkFailed(format!(
                    "{operation} aborted by connection loss"
                )))
            }
            Err(_) => {
                self.pending.remove(&correlation_id);
                Err(HarvestError::Timeout { operation, timeout })
            }
        }
    }

    /// Drop every pending correlation, failing their awaiting callers.
    fn fail_pending(&self) {
        self.pending.clear();
    }

    fn route(&self, frame: InboundFrame) {
        let Some(session_id) = frame.session_id.clone() else {
            if !matches!(frame.message, InboundMessage::Heartbeat) {
                debug!(
                    frame_type = frame.message.frame_type(),
                    "unscoped frame ignored"
                );
            }
            return;
        };

        if let Some((_, responder)) = self.pending.remove(&session_id) {
            if responder.send(frame.message).is_err() {
                debug!(correlation = %session_id, "response arrived after caller gave up");
            }
            return;
        }

        if let Some(subscriber) = self.subscribers.get(&session_id) {
            if subscriber.send(frame).is_err() {
                drop(subscriber);
                self.subscribers.remove(&session_id);
            }
            return;
        }

        debug!(session = %session_id, "frame for unknown session dropped");
    }
}

/// Runs the supervisor and hands the write-queue receiver back on exit so a
/// later `start()` can resume with queued frames intact.
async fn supervisor_loop(channel: Arc<WsChannel>, mut outbound_rx: mpsc::Receiver<String>) {
    supervise(&channel, &mut outbound_rx).await;
    *channel.outbound_rx.lock().await = Some(outbound_rx);
    debug!("sidecar channel supervisor exited");
}

/// Sleep the backoff, waking early only for shutdown.
async fn backoff_sleep(channel: &WsChannel, seconds: u64) {
    let sleep = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return,
            () = channel.demand.notified() => {
                if channel.shutdown.load(Ordering::Relaxed) {
                    return;
                }
            }
        }
    }
}

/// Owns the connect → serve → reconnect cycle.
///
/// `attempt` counts retries within one outage: 0 means a fresh connect with
/// no backoff; `ConnectionLost` is announced once when an outage begins and
/// `ConnectionRestored` when a retry succeeds. Five failed retries end the
/// outage fatally and the supervisor idles until new demand arrives.
async fn supervise(channel: &Arc<WsChannel>, outbound_rx: &mut mpsc::Receiver<String>) {
    loop {
        // Idle until someone needs the channel.
        if channel.shutdown.load(Ordering::Relaxed) {
            return;
        }
        channel.demand.notified().await;
        if channel.shutdown.load(Ordering::Relaxed) {
            return;
        }

        let mut attempt: u32 = 0;
        'cycle: loop {
            if channel.shutdown.load(Ordering::Relaxed) {
                return;
            }
            if attempt > 0 {
                if attempt as usize > RECONNECT_BACKOFF_SECS.len() {
                    warn!(url = %channel.url, "sidecar channel reconnect exhausted");
                    channel.bus.publish(HarvestEvent::connection_lost(
                        true,
                        RECONNECT_BACKOFF_SECS.len() as u32,
                    ));
                    channel.fail_pending();
                    break 'cycle;
                }
                let backoff = RECONNECT_BACKOFF_SECS[attempt as usize - 1];
                debug!(attempt, backoff_s = backoff, "sidecar channel backing off");
                backoff_sleep(channel, backoff).await;
            }

            let ws = match connect_async(channel.url.as_str()).await {
                Ok((ws, _)) => ws,
                Err(e) => {
                    debug!(attempt, error = %e, "sidecar channel connect failed");
                    if attempt == 0 {
                        // Outage begins on the first retry.
                        channel.bus.publish(HarvestEvent::connection_lost(false, 1));
                    }
                    attempt += 1;
                    continue 'cycle;
                }
            };

            channel.connected.store(true, Ordering::Relaxed);
            if attempt > 0 {
                info!(attempt, "sidecar channel restored");
                channel.bus.publish(HarvestEvent::connection_restored(attempt));
            } else {
                debug!(url = %channel.url, "sidecar channel connected");
            }
            attempt = 0;

            let end = serve_connection(channel, ws, outbound_rx).await;
            channel.connected.store(false, Ordering::Relaxed);

            match end {
                ConnectionEnd::Shutdown => return,
                ConnectionEnd::Dropped | ConnectionEnd::Stale => {
                    warn!("sidecar channel dropped, reconnecting");
                    channel.bus.publish(HarvestEvent::connection_lost(false, 1));
                    attempt = 1;
                }
            }
        }
    }
}

/// Drive one live connection until it ends.
async fn serve_connection(
    channel: &Arc<WsChannel>,
    ws: WsStream,
    outbound_rx: &mut mpsc::Receiver<String>,
) -> ConnectionEnd {
    let (mut writer, mut reader) = ws.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_alive = Instant::now();

    loop {
        if channel.shutdown.load(Ordering::Relaxed) {
            let _ = writer.send(Message::Close(None)).await;
            return ConnectionEnd::Shutdown;
        }

        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(text) = outbound else {
                    return ConnectionEnd::Shutdown;
                };
                if let Err(e) = writer.send(Message::Text(text)).await {
                    warn!(error = %e, "sidecar channel write failed");
                    return ConnectionEnd::Dropped;
                }
            }

            inbound = reader.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        last_alive = Instant::now();
                        match protocol::decode_frame(&text) {
                            Ok(frame) => channel.route(frame),
                            Err(e) => warn!(error = %e, "dropping malformed frame"),
                        }
                    }
                    Some(Ok(Message::Pong(_) | Message::Ping(_))) => {
                        last_alive = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return ConnectionEnd::Dropped;
                    }
                    Some(Ok(Message::Binary(_) | Message::Frame(_))) => {
                        debug!("ignoring non-text frame");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "sidecar channel read failed");
                        return ConnectionEnd::Dropped;
                    }
                }
            }

            _ = ping.tick() => {
                if last_alive.elapsed() > STALE_AFTER {
                    warn!(silent_for = ?last_alive.elapsed(), "sidecar channel stale");
                    return ConnectionEnd::Stale;
                }
                if let Err(e) = writer.send(Message::Ping(Vec::new())).await {
                    warn!(error = %e, "sidecar channel ping failed");
                    return ConnectionEnd::Dropped;
                }
            }

            // Stray demand wakes are harmless; a shutdown wake is caught by
            // the check at the top of the loop.
            () = channel.demand.notified() => {}
        }
    }
}
