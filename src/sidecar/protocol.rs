//! Control-channel frame protocol
//!
//! One message = one JSON object with envelope `{type, session_id?, payload}`.
//! Requests are a tagged-variant enum sharing the single transport; inbound
//! frames decode in two stages (envelope, then per-type payload) so a
//! malformed payload can be reported with its frame type only — payloads may
//! carry cookie values and never reach the logs verbatim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crawl::TimeRange;
use crate::error::{HarvestError, Result};

/// Cookie name → value map. Ordered so serialized forms are deterministic.
pub type CookieMap = BTreeMap<String, String>;

/// Sidecar error code signalling a CAPTCHA interstitial.
pub const ERROR_CODE_CAPTCHA: &str = "captcha_detected";
/// Sidecar error code signalling upstream rate limiting.
pub const ERROR_CODE_RATE_LIMITED: &str = "rate_limited";

/// Wire envelope shared by both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Requests the bridge issues to the sidecar.
#[derive(Debug, Clone)]
pub enum SidecarRequest {
    OpenSession,
    CloseSession,
    Validate {
        cookies: CookieMap,
    },
    Search {
        cookies: CookieMap,
        keyword: String,
        range: TimeRange,
        page: u32,
    },
}

impl SidecarRequest {
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::OpenSession => "open_session",
            Self::CloseSession => "close_session",
            Self::Validate { .. } => "validate",
            Self::Search { .. } => "search",
        }
    }

    fn payload(&self) -> Result<Value> {
        let value = match self {
            Self::OpenSession | Self::CloseSession => Value::Object(serde_json::Map::new()),
            Self::Validate { cookies } => serde_json::json!({ "cookies": cookies }),
            Self::Search {
                cookies,
                keyword,
                range,
                page,
            } => serde_json::json!({
                "cookies": cookies,
                "keyword": keyword,
                "range": { "start": range.start, "end": range.end },
                "page": page,
            }),
        };
        Ok(value)
    }

    /// Serialize as one wire frame scoped to `session_id`.
    pub fn encode(&self, session_id: &str) -> Result<String> {
        let envelope = Envelope {
            frame_type: self.frame_type().to_string(),
            session_id: Some(session_id.to_string()),
            payload: self.payload()?,
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

/// Scan status reported by the sidecar during a QR session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Scanned,
    Confirmed,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrGeneratedPayload {
    /// Base64 PNG
    pub qr_image: String,
    /// Seconds until the QR expires; the sidecar's value is authoritative
    pub expires_in: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdatePayload {
    pub status: ScanStatus,
    /// Present on `Confirmed`
    #[serde(default)]
    pub cookies: Option<CookieMap>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResultPayload {
    pub valid: bool,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One post as the sidecar reports it from a search page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPost {
    pub id: String,
    /// Unix seconds
    pub published_at: i64,
    pub content: String,
    pub author: String,
    /// Side metadata the upstream attaches (repost counts, media refs, ...)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultPayload {
    #[serde(default)]
    pub posts: Vec<RawPost>,
    #[serde(default)]
    pub has_next_page: bool,
    #[serde(default)]
    pub total_pages: Option<u32>,
    /// The sidecar reports CAPTCHA interstitials in-band
    #[serde(default)]
    pub captcha_detected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Decoded inbound message.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    QrGenerated(QrGeneratedPayload),
    StatusUpdate(StatusUpdatePayload),
    ValidationResult(ValidationResultPayload),
    SearchResult(SearchResultPayload),
    Error(ErrorPayload),
    Heartbeat,
}

impl InboundMessage {
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::QrGenerated(_) => "qr_generated",
            Self::StatusUpdate(_) => "status_update",
            Self::ValidationResult(_) => "validation_result",
            Self::SearchResult(_) => "search_result",
            Self::Error(_) => "error",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// A routed inbound frame.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub session_id: Option<String>,
    pub message: InboundMessage,
}

/// Decode one wire frame.
///
/// Failures carry the frame type (when known) but never the payload body.
pub fn decode_frame(text: &str) -> Result<InboundFrame> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| HarvestError::MalformedFrame(format!("envelope: {e}")))?;

    let typed = |label: &str, err: serde_json::Error| {
        HarvestError::MalformedFrame(format!("{label} payload: {err}"))
    };

    let message = match envelope.frame_type.as_str() {
        "qr_generated" => InboundMessage::QrGenerated(
            serde_json::from_value(envelope.payload).map_err(|e| typed("qr_generated", e))?,
        ),
        "status_update" => InboundMessage::StatusUpdate(
            serde_json::from_value(envelope.payload).map_err(|e| typed("status_update", e))?,
        ),
        "validation_result" => InboundMessage::ValidationResult(
            serde_json::from_value(envelope.payload).map_err(|e| typed("validation_result", e))?,
        ),
        "search_result" => InboundMessage::SearchResult(
            serde_json::from_value(envelope.payload).map_err(|e| typed("search_result", e))?,
        ),
        "error" => InboundMessage::Error(
            serde_json::from_value(envelope.payload).map_err(|e| typed("error", e))?,
        ),
        "heartbeat" => InboundMessage::Heartbeat,
        other => {
            return Err(HarvestError::MalformedFrame(format!(
                "unknown frame type {other}"
            )));
        }
    };

    Ok(InboundFrame {
        session_id: envelope.session_id,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn search_request_encodes_envelope() {
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 10, 6, 0, 0).unwrap(),
        )
        .unwrap();
        let mut cookies = CookieMap::new();
        cookies.insert("SUB".into(), "t".into());

        let request = SidecarRequest::Search {
            cookies,
            keyword: "rustlang".into(),
            range,
            page: 3,
        };
        let encoded = request.encode("corr-1").unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["type"], "search");
        assert_eq!(value["session_id"], "corr-1");
        assert_eq!(value["payload"]["keyword"], "rustlang");
        assert_eq!(value["payload"]["page"], 3);
    }

    #[test]
    fn decodes_status_update_with_cookies() {
        let text = r#"{"type":"status_update","session_id":"s-9","payload":{"status":"confirmed","cookies":{"SUB":"t","SUBP":"s"}}}"#;
        let frame = decode_frame(text).unwrap();
        assert_eq!(frame.session_id.as_deref(), Some("s-9"));
        match frame.message {
            InboundMessage::StatusUpdate(payload) => {
                assert_eq!(payload.status, ScanStatus::Confirmed);
                assert_eq!(payload.cookies.unwrap()["SUB"], "t");
            }
            other => panic!("unexpected message: {}", other.frame_type()),
        }
    }

    #[test]
    fn decodes_heartbeat_without_payload() {
        let frame = decode_frame(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(frame.message, InboundMessage::Heartbeat));
        assert!(frame.session_id.is_none());
    }

    #[test]
    fn rejects_unknown_type_and_garbage() {
        assert!(decode_frame(r#"{"type":"mystery","payload":{}}"#).is_err());
        assert!(decode_frame("not json at all").is_err());
    }

    #[test]
    fn malformed_payload_error_omits_body() {
        let text = r#"{"type":"search_result","payload":{"posts":"nope"}}"#;
        let err = decode_frame(text).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("search_result"));
        assert!(!rendered.contains("nope"));
    }

    #[test]
    fn raw_post_keeps_side_metadata() {
        let text = r#"{"type":"search_result","payload":{"posts":[{"id":"p1","published_at":1715300000,"content":"hi","author":"a","reposts":12}],"has_next_page":true,"total_pages":40}}"#;
        let frame = decode_frame(text).unwrap();
        match frame.message {
            InboundMessage::SearchResult(payload) => {
                assert_eq!(payload.posts.len(), 1);
                assert_eq!(payload.posts[0].extra["reposts"], 12);
                assert_eq!(payload.total_pages, Some(40));
            }
            other => panic!("unexpected message: {}", other.frame_type()),
        }
    }
}
