//! Crate-wide error taxonomy
//!
//! Every error kind maps to a stable string code that the front end matches
//! on; the free-form display message is advisory only. Retry policy is driven
//! by [`HarvestError::is_retryable`], not by string inspection.

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T, E = HarvestError> = std::result::Result<T, E>;

/// Reasons a credential set can fail validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    /// A cookie required by the profile probe is absent
    #[error("required cookie missing: {name}")]
    MissingCookie { name: String },

    /// The profile probe rejected the cookie set
    #[error("profile probe rejected: {status}")]
    ProbeRejected { status: String },

    /// The probe returned a uid different from the expected one
    #[error("uid mismatch: expected {expected}, got {actual}")]
    UidMismatch { expected: String, actual: String },

    /// The probe did not answer within the validation deadline
    #[error("validation timed out")]
    Timeout,
}

impl ValidationFailure {
    /// Stable code for the front end.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCookie { .. } => "MissingCookie",
            Self::ProbeRejected { .. } => "ProfileApiFailed",
            Self::UidMismatch { .. } => "UidMismatch",
            Self::Timeout => "ValidationTimeout",
        }
    }
}

/// Error type shared by every component of the harvester.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    // -- Transport ----------------------------------------------------------
    /// Network I/O against the sidecar or upstream failed
    #[error("network operation failed: {0}")]
    NetworkFailed(String),

    /// An operation exceeded its deadline
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The sidecar control channel dropped; `fatal` means reconnection was
    /// exhausted
    #[error("sidecar connection lost (fatal: {fatal})")]
    ConnectionLost { fatal: bool },

    // -- Protocol -----------------------------------------------------------
    /// The sidecar answered with something the protocol does not allow
    #[error("invalid response from sidecar: {0}")]
    InvalidResponse(String),

    /// A frame on the control channel could not be decoded
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    // -- Domain -------------------------------------------------------------
    /// The QR session reached its expiry before a terminal scan state
    #[error("qr session expired")]
    QrExpired,

    /// No live QR session with the given identifier
    #[error("qr session not found: {0}")]
    QrNotFound(String),

    /// A cookie set failed the validation gate
    #[error("validation failed: {0}")]
    ValidationFailed(#[from] ValidationFailure),

    /// No stored credential record for the account
    #[error("no stored credential for uid {0}")]
    CredentialNotFound(String),

    /// No crawl task with the given identifier
    #[error("crawl task not found: {0}")]
    TaskNotFound(String),

    /// The requested transition is not legal from the task's current status
    #[error("operation not allowed while task is {actual} (wanted {wanted})")]
    InvalidStatus {
        wanted: &'static str,
        actual: String,
    },

    /// The upstream presented a CAPTCHA challenge; never retried
    #[error("captcha challenge detected")]
    CaptchaDetected,

    /// Keyword failed structural validation
    #[error("invalid keyword: {0}")]
    InvalidKeyword(String),

    /// A supplied wall-clock bound is unusable
    #[error("invalid time: {0}")]
    InvalidTime(String),

    // -- Storage ------------------------------------------------------------
    /// Redis was unreachable or the command failed at the connection level
    #[error("redis operation failed: {0}")]
    RedisConnection(String),

    /// A stored payload could not be (de)serialized
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A persisted checkpoint no longer deserializes; the task must be
    /// deleted by the user, never auto-reset
    #[error("checkpoint corrupt for task {task_id}: {detail}")]
    CheckpointCorrupt { task_id: String, detail: String },

    // -- Resource -----------------------------------------------------------
    /// The upstream signalled rate limiting
    #[error("rate limited by upstream")]
    RateLimited,

    /// An export selection matched no posts
    #[error("no data matched the selection")]
    NoData,

    /// The sidecar process is not running or unhealthy
    #[error("sidecar unavailable: {0}")]
    SidecarUnavailable(String),
}

impl HarvestError {
    /// Stable machine-readable code for the front end.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NetworkFailed(_) => "NetworkFailed",
            Self::Timeout { .. } => "Timeout",
            Self::ConnectionLost { .. } => "ConnectionLost",
            Self::InvalidResponse(_) => "InvalidResponse",
            Self::MalformedFrame(_) => "MalformedFrame",
            Self::QrExpired => "QrCodeExpired",
            Self::QrNotFound(_) => "QrNotFound",
            Self::ValidationFailed(reason) => reason.code(),
            Self::CredentialNotFound(_) => "CredentialNotFound",
            Self::TaskNotFound(_) => "TaskNotFound",
            Self::InvalidStatus { .. } => "InvalidStatus",
            Self::CaptchaDetected => "CaptchaDetected",
            Self::InvalidKeyword(_) => "InvalidKeyword",
            Self::InvalidTime(_) => "InvalidTime",
            Self::RedisConnection(_) => "RedisConnectionFailed",
            Self::Serialization(_) => "SerializationError",
            Self::CheckpointCorrupt { .. } => "CheckpointCorrupt",
            Self::RateLimited => "RateLimited",
            Self::NoData => "NoData",
            Self::SidecarUnavailable(_) => "SidecarUnavailable",
        }
    }

    /// Whether a caller-side retry can reasonably succeed.
    ///
    /// Domain and protocol errors are never retryable; transport, storage
    /// connectivity, and rate limiting are.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkFailed(_)
                | Self::Timeout { .. }
                | Self::ConnectionLost { .. }
                | Self::RedisConnection(_)
                | Self::RateLimited
                | Self::SidecarUnavailable(_)
        )
    }
}

impl From<redis::RedisError> for HarvestError {
    fn from(err: redis::RedisError) -> Self {
        Self::RedisConnection(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for HarvestError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::RedisConnection(err.to_string())
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HarvestError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::NetworkFailed(err.to_string())
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(err: reqwest::Error) -> Self {
        Self::NetworkFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(HarvestError::QrExpired.code(), "QrCodeExpired");
        assert_eq!(HarvestError::CaptchaDetected.code(), "CaptchaDetected");
        assert_eq!(
            HarvestError::RedisConnection("boom".into()).code(),
            "RedisConnectionFailed"
        );
        let mismatch = HarvestError::ValidationFailed(ValidationFailure::UidMismatch {
            expected: "1".into(),
            actual: "2".into(),
        });
        assert_eq!(mismatch.code(), "UidMismatch");
    }

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(HarvestError::NetworkFailed("reset".into()).is_retryable());
        assert!(HarvestError::ConnectionLost { fatal: true }.is_retryable());
        assert!(!HarvestError::CaptchaDetected.is_retryable());
        assert!(!HarvestError::QrExpired.is_retryable());
        assert!(
            !HarvestError::ValidationFailed(ValidationFailure::Timeout).is_retryable()
        );
    }
}
