//! Event payload definitions
//!
//! One-way notifications from the back end to the single UI consumer. Each
//! payload carries its entity identifier and a timestamp; topics are stable
//! strings the front end routes on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crawl::{TaskStatus, TimeRange};

/// Login lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginEventType {
    QrGenerated,
    QrScanned,
    Confirmed,
    ValidationSuccess,
    ValidationFailed,
    QrExpired,
    ConnectionLost,
    ConnectionRestored,
    Error,
}

/// A single login lifecycle notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginEvent {
    pub event_type: LoginEventType,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub uid: Option<String>,
    /// Event-specific attributes (qr image, expiry, failure reason, ...)
    pub details: serde_json::Value,
}

impl LoginEvent {
    #[must_use]
    pub fn new(event_type: LoginEventType, session_id: impl Into<String>) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            session_id: session_id.into(),
            uid: None,
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Per-page crawl progress snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlProgress {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub current_range: TimeRange,
    pub current_page: u32,
    pub crawled_count: u64,
    pub timestamp: DateTime<Utc>,
}

/// Everything the bus carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HarvestEvent {
    LoginStatus(LoginEvent),
    LoginError(LoginEvent),
    ConnectionLost {
        fatal: bool,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    ConnectionRestored {
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    CrawlProgress(CrawlProgress),
    CrawlCompleted {
        task_id: Uuid,
        crawled_count: u64,
        timestamp: DateTime<Utc>,
    },
    CrawlError {
        task_id: Uuid,
        code: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl HarvestEvent {
    /// Topic string the front end subscribes on.
    #[must_use]
    pub fn topic(&self) -> &'static str {
        match self {
            Self::LoginStatus(_) => "login_status_update",
            Self::LoginError(_) => "login_error",
            Self::ConnectionLost { .. } => "websocket_connection_lost",
            Self::ConnectionRestored { .. } => "websocket_connection_restored",
            Self::CrawlProgress(_) => "crawl_progress",
            Self::CrawlCompleted { .. } => "crawl_completed",
            Self::CrawlError { .. } => "crawl_error",
        }
    }

    #[must_use]
    pub fn connection_lost(fatal: bool, attempt: u32) -> Self {
        Self::ConnectionLost {
            fatal,
            attempt,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn connection_restored(attempt: u32) -> Self {
        Self::ConnectionRestored {
            attempt,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn crawl_completed(task_id: Uuid, crawled_count: u64) -> Self {
        Self::CrawlCompleted {
            task_id,
            crawled_count,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn crawl_error(task_id: Uuid, code: &str, message: impl Into<String>) -> Self {
        Self::CrawlError {
            task_id,
            code: code.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
