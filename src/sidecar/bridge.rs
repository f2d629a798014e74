//! Capability facade over the sidecar
//!
//! The rest of the system sees four verbs: open a QR session, validate a
//! cookie set, search one page of a keyword window, and health. The bridge
//! hides the subprocess and the control channel behind those verbs; it is
//! constructed once at startup and injected wherever needed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::HarvesterConfig;
use crate::crawl::TimeRange;
use crate::error::{HarvestError, Result};
use crate::events::EventBus;
use crate::logging::cookie_names;

use super::channel::WsChannel;
use super::process::SidecarProcess;
use super::protocol::{
    CookieMap, ERROR_CODE_CAPTCHA, ERROR_CODE_RATE_LIMITED, ErrorPayload, InboundFrame,
    InboundMessage, QrGeneratedPayload, SidecarRequest, ValidationResultPayload,
};

/// Deadline for the sidecar to answer an `open_session` with a QR image.
const OPEN_SESSION_TIMEOUT: Duration = Duration::from_secs(15);
/// Profile probe deadline.
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(10);
/// Single page fetch deadline.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);
/// Used when the sidecar omits `expires_in`.
const DEFAULT_QR_EXPIRES_IN: Duration = Duration::from_secs(180);

/// A freshly opened QR login session.
#[derive(Debug, Clone)]
pub struct QrSession {
    pub session_id: String,
    /// Base64 PNG
    pub qr_image: String,
    pub expires_in: Duration,
}

/// One page of keyword search results.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub posts: Vec<super::protocol::RawPost>,
    pub has_next_page: bool,
    pub total_pages: Option<u32>,
}

/// Live frame stream for one QR session. Unsubscribes on drop.
pub struct SessionStream {
    session_id: String,
    channel: Arc<WsChannel>,
    rx: mpsc::UnboundedReceiver<InboundFrame>,
}

impl SessionStream {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next frame for this session; `None` when the channel shut down.
    pub async fn recv(&mut self) -> Option<InboundFrame> {
        self.rx.recv().await
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.channel.unsubscribe_session(&self.session_id);
    }
}

/// The singleton sidecar capability.
pub struct SidecarBridge {
    process: Arc<SidecarProcess>,
    channel: Arc<WsChannel>,
}

impl SidecarBridge {
    #[must_use]
    pub fn new(config: &HarvesterConfig, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            process: SidecarProcess::new(config),
            channel: WsChannel::new(config.sidecar_ws_url.clone(), bus),
        })
    }

    /// Start the subprocess and the control channel supervisor.
    pub async fn start(&self) -> Result<()> {
        self.process.start().await?;
        self.channel.start().await;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.channel.stop().await;
        self.process.stop().await
    }

    pub async fn health(&self) -> bool {
        self.process.health().await
    }

    /// Subprocess handle, for the logs/status RPCs.
    #[must_use]
    pub fn process(&self) -> &Arc<SidecarProcess> {
        &self.process
    }

    /// Open a QR login session.
    ///
    /// The session id is generated here and scopes every subsequent frame;
    /// the sidecar keeps server-side state under the same id across channel
    /// reconnects.
    pub async fn open_session(&self) -> Result<(QrSession, SessionStream)> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let rx = self.channel.subscribe_session(&session_id);
        let mut stream = SessionStream {
            session_id: session_id.clone(),
            channel: Arc::clone(&self.channel),
            rx,
        };

        self.channel
            .send_raw(SidecarRequest::OpenSession.encode(&session_id)?)
            .await?;

        let first = tokio::time::timeout(OPEN_SESSION_TIMEOUT, stream.recv())
            .await
            .map_err(|_| HarvestError::Timeout {
                operation: "open_session",
                timeout: OPEN_SESSION_TIMEOUT,
            })?
            .ok_or(HarvestError::ConnectionLost { fatal: true })?;

        match first.message {
            InboundMessage::QrGenerated(QrGeneratedPayload {
                qr_image,
                expires_in,
            }) => {
                let expires_in = expires_in
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_QR_EXPIRES_IN);
                debug!(session = %session_id, expires_in_s = expires_in.as_secs(), "qr session opened");
                Ok((
                    QrSession {
                        session_id,
                        qr_image,
                        expires_in,
                    },
                    stream,
                ))
            }
            InboundMessage::Error(payload) => Err(map_error_payload(&payload)),
            other => Err(HarvestError::InvalidResponse(format!(
                "expected qr_generated, got {}",
                other.frame_type()
            ))),
        }
    }

    /// Release a session's server-side state.
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        self.channel
            .send_raw(SidecarRequest::CloseSession.encode(session_id)?)
            .await
    }

    /// Run the profile probe with a cookie set.
    pub async fn validate(&self, cookies: CookieMap) -> Result<ValidationResultPayload> {
        debug!(cookies = %cookie_names(&cookies), "validating cookie set");
        let response = self
            .channel
            .request(SidecarRequest::Validate { cookies }, VALIDATE_TIMEOUT, "validate")
            .await?;

        match response {
            InboundMessage::ValidationResult(payload) => Ok(payload),
            InboundMessage::Error(payload) => Err(map_error_payload(&payload)),
            other => Err(HarvestError::InvalidResponse(format!(
                "expected validation_result, got {}",
                other.frame_type()
            ))),
        }
    }

    /// Fetch one page of keyword results within a time window.
    ///
    /// Anything that is not a post list is treated as a potential CAPTCHA
    /// and surfaced as non-retryable.
    pub async fn search(
        &self,
        cookies: CookieMap,
        keyword: &str,
        range: TimeRange,
        page: u32,
    ) -> Result<SearchPage> {
        debug!(
            cookies = %cookie_names(&cookies),
            keyword,
            page,
            start = %range.start,
            end = %range.end,
            "searching page"
        );
        let response = self
            .channel
            .request(
                SidecarRequest::Search {
                    cookies,
                    keyword: keyword.to_string(),
                    range,
                    page,
                },
                SEARCH_TIMEOUT,
                "search",
            )
            .await?;

        match response {
            InboundMessage::SearchResult(payload) => {
                if payload.captcha_detected {
                    return Err(HarvestError::CaptchaDetected);
                }
                Ok(SearchPage {
                    posts: payload.posts,
                    has_next_page: payload.has_next_page,
                    total_pages: payload.total_pages,
                })
            }
            InboundMessage::Error(payload) => Err(map_error_payload(&payload)),
            other => {
                debug!(
                    frame_type = other.frame_type(),
                    "non-post-list search response, treating as captcha"
                );
                Err(HarvestError::CaptchaDetected)
            }
        }
    }
}

fn map_error_payload(payload: &ErrorPayload) -> HarvestError {
    match payload.code.as_str() {
        ERROR_CODE_CAPTCHA => HarvestError::CaptchaDetected,
        ERROR_CODE_RATE_LIMITED => HarvestError::RateLimited,
        _ => HarvestError::NetworkFailed(format!("{}: {}", payload.code, payload.message)),
    }
}
