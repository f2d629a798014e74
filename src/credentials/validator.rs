//! Credential validation gate
//!
//! Confirms a cookie set against the upstream profile probe through the
//! sidecar and extracts the account identity. No retries at this layer;
//! the caller decides what a failure means.

use std::sync::Arc;

use tracing::debug;

use crate::error::{HarvestError, Result, ValidationFailure};
use crate::sidecar::{CookieMap, SidecarBridge};

use super::record::missing_required_cookie;

/// Identity extracted from a successful probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedIdentity {
    pub uid: String,
    pub display_name: Option<String>,
}

/// Probe-backed validator.
pub struct CredentialValidator {
    bridge: Arc<SidecarBridge>,
}

impl CredentialValidator {
    #[must_use]
    pub fn new(bridge: Arc<SidecarBridge>) -> Self {
        Self { bridge }
    }

    /// Validate a cookie set; `expected_uid` enables the cross-check used
    /// by explicit re-saves.
    pub async fn validate(
        &self,
        cookies: &CookieMap,
        expected_uid: Option<&str>,
    ) -> Result<ValidatedIdentity> {
        if let Some(name) = missing_required_cookie(cookies) {
            return Err(ValidationFailure::MissingCookie {
                name: name.to_string(),
            }
            .into());
        }

        let result = match self.bridge.validate(cookies.clone()).await {
            Ok(result) => result,
            Err(HarvestError::Timeout { .. }) => {
                return Err(ValidationFailure::Timeout.into());
            }
            Err(other) => return Err(other),
        };

        if !result.valid {
            return Err(ValidationFailure::ProbeRejected {
                status: result.error.unwrap_or_else(|| "rejected".to_string()),
            }
            .into());
        }

        // A 2xx probe without a uid is still a rejection.
        let Some(uid) = result.uid.filter(|uid| !uid.is_empty()) else {
            return Err(ValidationFailure::ProbeRejected {
                status: "no-uid".to_string(),
            }
            .into());
        };

        if let Some(expected) = expected_uid {
            if expected != uid {
                return Err(ValidationFailure::UidMismatch {
                    expected: expected.to_string(),
                    actual: uid,
                }
                .into());
            }
        }

        debug!(uid = %uid, "cookie set validated");
        Ok(ValidatedIdentity {
            uid,
            display_name: result.display_name,
        })
    }
}
