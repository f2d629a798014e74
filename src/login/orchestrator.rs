//! Login orchestration
//!
//! Drives one end-to-end login attempt per session: acquire the QR through
//! the bridge, relay scan/confirm frames into the state machine, run the
//! validation gate, persist the credential record, and fan every transition
//! out to the event bus exactly once.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialRecord, CredentialStore, CredentialValidator};
use crate::error::{HarvestError, Result};
use crate::events::{EventBus, HarvestEvent, LoginEvent, LoginEventType};
use crate::sidecar::{CookieMap, InboundFrame, InboundMessage, ScanStatus, SessionStream, SidecarBridge};

use super::session::{LoginSession, LoginState, Transition};

/// How long a terminal session stays pollable before it is discarded.
const TERMINAL_RETENTION: Duration = Duration::from_secs(60);

/// Result of `generate_qrcode`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QrCodeIssued {
    pub qr_id: String,
    pub qr_image_b64: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in: u64,
}

/// Result of `poll_login_status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PollStatus {
    pub status: LoginState,
    pub cookies: Option<CookieMap>,
    pub updated_at: DateTime<Utc>,
}

struct SessionEntry {
    session: Arc<RwLock<LoginSession>>,
    driver: JoinHandle<()>,
}

/// Owns every live login session.
pub struct LoginOrchestrator {
    bridge: Arc<SidecarBridge>,
    validator: Arc<CredentialValidator>,
    store: Arc<CredentialStore>,
    bus: Arc<EventBus>,
    sessions: Arc<DashMap<String, SessionEntry>>,
}

impl LoginOrchestrator {
    #[must_use]
    pub fn new(
        bridge: Arc<SidecarBridge>,
        validator: Arc<CredentialValidator>,
        store: Arc<CredentialStore>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            validator,
            store,
            bus,
            sessions: Arc::new(DashMap::new()),
        })
    }

    /// Open a login attempt: acquire a QR session and start its driver.
    pub async fn open_login(self: &Arc<Self>) -> Result<QrCodeIssued> {
        let (qr, stream) = self.bridge.open_session().await?;
        let session = LoginSession::new(&qr.session_id, &qr.qr_image, qr.expires_in);

        let issued = QrCodeIssued {
            qr_id: session.qr_id.clone(),
            qr_image_b64: session.qr_image.clone(),
            expires_at: session.expires_at,
            expires_in: qr.expires_in.as_secs(),
        };

        self.emit_status(
            LoginEvent::new(LoginEventType::QrGenerated, &session.qr_id).with_details(json!({
                "qr_image": session.qr_image,
                "expires_in": qr.expires_in.as_secs(),
                "auto_refreshed": false,
            })),
        );

        let shared = Arc::new(RwLock::new(session));
        let orchestrator = Arc::clone(self);
        let driver_session = Arc::clone(&shared);
        let driver = tokio::spawn(async move {
            orchestrator.drive_session(driver_session, stream).await;
        });

        self.sessions.insert(
            issued.qr_id.clone(),
            SessionEntry {
                session: shared,
                driver,
            },
        );

        info!(qr_id = %issued.qr_id, "login session opened");
        Ok(issued)
    }

    /// Current status of a session.
    ///
    /// An expired session answers with the `QrCodeExpired` domain error;
    /// unknown ids (including discarded terminal sessions) answer
    /// `QrNotFound`.
    pub async fn poll(&self, qr_id: &str) -> Result<PollStatus> {
        let entry = self
            .sessions
            .get(qr_id)
            .ok_or_else(|| HarvestError::QrNotFound(qr_id.to_string()))?;
        let session = entry.session.read().await;

        if session.state == LoginState::Expired {
            return Err(HarvestError::QrExpired);
        }

        Ok(PollStatus {
            status: session.state,
            cookies: session.cookies.clone(),
            updated_at: session.updated_at,
        })
    }

    /// Release a session. The sidecar's server-side state times out on its
    /// own; idempotent for unknown ids.
    pub async fn cancel(&self, qr_id: &str) -> Result<()> {
        if let Some((_, entry)) = self.sessions.remove(qr_id) {
            entry.driver.abort();
            if let Err(e) = self.bridge.close_session(qr_id).await {
                debug!(qr_id, error = %e, "close_session after cancel failed");
            }
            info!(qr_id, "login session cancelled");
        }
        Ok(())
    }

    /// Number of sessions currently tracked (terminal ones included).
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn emit_status(&self, event: LoginEvent) {
        self.bus.publish(HarvestEvent::LoginStatus(event));
    }

    fn emit_error(&self, event: LoginEvent) {
        self.bus.publish(HarvestEvent::LoginError(event));
    }

    /// Per-session driver: consumes frames until a terminal transition,
    /// racing the expiry deadline. The deadline is re-read every iteration
    /// so an auto-refresh extends it transparently.
    async fn drive_session(
        self: Arc<Self>,
        shared: Arc<RwLock<LoginSession>>,
        mut stream: SessionStream,
    ) {
        let qr_id = stream.session_id().to_string();

        loop {
            let deadline = shared.read().await.expires_at;
            let until = (deadline - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                frame = stream.recv() => {
                    match frame {
                        Some(frame) => {
                            if let ControlFlow::Break(()) =
                                self.handle_frame(&qr_id, &shared, frame).await
                            {
                                break;
                            }
                        }
                        None => {
                            // Channel gone for good; reconnections would have
                            // kept the subscriber alive.
                            let mut session = shared.write().await;
                            if session
                                .apply(Transition::Failed { code: "ConnectionLost".into() })
                                .is_ok()
                            {
                                drop(session);
                                self.emit_error(
                                    LoginEvent::new(LoginEventType::Error, &qr_id)
                                        .with_details(json!({ "code": "ConnectionLost" })),
                                );
                            }
                            break;
                        }
                    }
                }

                _ = tokio::time::sleep(until) => {
                    let mut session = shared.write().await;
                    if session.is_expired_at(Utc::now()) {
                        if session.apply(Transition::Expired).is_ok() {
                            drop(session);
                            self.emit_status(LoginEvent::new(LoginEventType::QrExpired, &qr_id));
                        }
                        break;
                    }
                    // Deadline was pushed out by a refresh; keep waiting.
                }
            }
        }

        if let Err(e) = self.bridge.close_session(&qr_id).await {
            debug!(qr_id = %qr_id, error = %e, "close_session after terminal state failed");
        }

        // Keep the terminal session pollable briefly, then discard.
        tokio::time::sleep(TERMINAL_RETENTION).await;
        self.sessions.remove(&qr_id);
        debug!(qr_id = %qr_id, "terminal login session discarded");
    }

    async fn handle_frame(
        &self,
        qr_id: &str,
        shared: &Arc<RwLock<LoginSession>>,
        frame: InboundFrame,
    ) -> ControlFlow<()> {
        match frame.message {
            InboundMessage::QrGenerated(payload) => {
                let expires_in = payload
                    .expires_in
                    .map_or(Duration::from_secs(180), Duration::from_secs);
                let mut session = shared.write().await;
                if session.refresh(&payload.qr_image, expires_in).is_ok() {
                    drop(session);
                    debug!(qr_id, "qr auto-refreshed");
                    self.emit_status(
                        LoginEvent::new(LoginEventType::QrGenerated, qr_id).with_details(json!({
                            "qr_image": payload.qr_image,
                            "expires_in": expires_in.as_secs(),
                            "auto_refreshed": true,
                        })),
                    );
                }
                ControlFlow::Continue(())
            }

            InboundMessage::StatusUpdate(payload) => {
                self.handle_status(qr_id, shared, payload.status, payload.cookies)
                    .await
            }

            InboundMessage::Error(payload) => {
                let mut session = shared.write().await;
                if session
                    .apply(Transition::Failed {
                        code: payload.code.clone(),
                    })
                    .is_ok()
                {
                    drop(session);
                    self.emit_error(
                        LoginEvent::new(LoginEventType::Error, qr_id)
                            .with_details(json!({ "code": payload.code, "message": payload.message })),
                    );
                }
                ControlFlow::Break(())
            }

            // Not meaningful inside a login session.
            InboundMessage::ValidationResult(_)
            | InboundMessage::SearchResult(_)
            | InboundMessage::Heartbeat => ControlFlow::Continue(()),
        }
    }

    async fn handle_status(
        &self,
        qr_id: &str,
        shared: &Arc<RwLock<LoginSession>>,
        status: ScanStatus,
        cookies: Option<CookieMap>,
    ) -> ControlFlow<()> {
        match status {
            ScanStatus::Pending => ControlFlow::Continue(()),

            ScanStatus::Scanned => {
                let mut session = shared.write().await;
                if session.apply(Transition::Scanned).is_ok() {
                    drop(session);
                    self.emit_status(LoginEvent::new(LoginEventType::QrScanned, qr_id));
                }
                ControlFlow::Continue(())
            }

            ScanStatus::Confirmed => {
                let Some(cookies) = cookies else {
                    warn!(qr_id, "confirmed status without cookies");
                    let mut session = shared.write().await;
                    if session
                        .apply(Transition::Failed {
                            code: "InvalidResponse".into(),
                        })
                        .is_ok()
                    {
                        drop(session);
                        self.emit_error(
                            LoginEvent::new(LoginEventType::Error, qr_id)
                                .with_details(json!({ "code": "InvalidResponse" })),
                        );
                    }
                    return ControlFlow::Break(());
                };

                {
                    let mut session = shared.write().await;
                    if session
                        .apply(Transition::Confirmed { cookies })
                        .is_err()
                    {
                        return ControlFlow::Continue(());
                    }
                }
                self.emit_status(LoginEvent::new(LoginEventType::Confirmed, qr_id));

                self.run_validation(qr_id, shared).await;
                ControlFlow::Break(())
            }

            ScanStatus::Rejected => {
                let mut session = shared.write().await;
                if session.apply(Transition::Rejected).is_ok() {
                    drop(session);
                    self.emit_error(
                        LoginEvent::new(LoginEventType::Error, qr_id)
                            .with_details(json!({ "code": "Rejected" })),
                    );
                }
                ControlFlow::Break(())
            }

            ScanStatus::Expired => {
                let mut session = shared.write().await;
                if session.apply(Transition::Expired).is_ok() {
                    drop(session);
                    self.emit_status(LoginEvent::new(LoginEventType::QrExpired, qr_id));
                }
                ControlFlow::Break(())
            }
        }
    }

    /// Validate the confirmed cookies and persist on success. Either way the
    /// session reaches a terminal state and exactly one event is emitted.
    async fn run_validation(&self, qr_id: &str, shared: &Arc<RwLock<LoginSession>>) {
        let (cookies, fetched_at) = {
            let session = shared.read().await;
            (
                session.cookies.clone().unwrap_or_default(),
                session.confirmed_at.unwrap_or_else(Utc::now),
            )
        };

        let failure = match self.validator.validate(&cookies, None).await {
            Ok(identity) => {
                let record = CredentialRecord::new(
                    identity.uid.clone(),
                    cookies,
                    fetched_at,
                    identity.display_name.clone(),
                );
                match self.store.save(&record).await {
                    Ok(receipt) => {
                        let mut session = shared.write().await;
                        if session
                            .apply(Transition::ValidationSucceeded {
                                uid: identity.uid.clone(),
                            })
                            .is_ok()
                        {
                            drop(session);
                            self.emit_status(
                                LoginEvent::new(LoginEventType::ValidationSuccess, qr_id)
                                    .with_uid(identity.uid)
                                    .with_details(json!({
                                        "display_name": identity.display_name,
                                        "key": receipt.key,
                                    })),
                            );
                        }
                        return;
                    }
                    Err(storage_err) => storage_err,
                }
            }
            Err(validation_err) => validation_err,
        };

        let code = failure.code();
        warn!(qr_id, code, error = %failure, "login validation failed");
        let mut session = shared.write().await;
        if session
            .apply(Transition::ValidationFailed { code: code.into() })
            .is_ok()
        {
            drop(session);
            self.emit_error(
                LoginEvent::new(LoginEventType::ValidationFailed, qr_id)
                    .with_details(json!({ "code": code, "message": failure.to_string() })),
            );
        }
    }
}
