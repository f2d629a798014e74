//! Credential record model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result, ValidationFailure};
use crate::sidecar::CookieMap;

/// Cookie names the upstream profile probe requires: the session subject
/// token and its secondary pair.
pub const REQUIRED_COOKIES: [&str; 2] = ["SUB", "SUBP"];

/// The persisted artifact of a successful validation.
///
/// Records only exist once a cookie set has passed the probe; the store
/// trusts its callers on that, and the orchestrator is the only writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Account identifier, primary key
    pub uid: String,
    pub cookies: CookieMap,
    pub fetched_at: DateTime<Utc>,
    pub validated_at: DateTime<Utc>,
    pub display_name: Option<String>,
}

impl CredentialRecord {
    /// Build a record stamped with `validated_at = now`.
    #[must_use]
    pub fn new(
        uid: impl Into<String>,
        cookies: CookieMap,
        fetched_at: DateTime<Utc>,
        display_name: Option<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            cookies,
            fetched_at,
            validated_at: Utc::now(),
            display_name,
        }
    }

    /// Derived storage key: `<namespace>:cookies:<uid>`.
    #[must_use]
    pub fn storage_key(&self, namespace: &str) -> String {
        format!("{namespace}:cookies:{}", self.uid)
    }

    /// Structural validation gate applied before any save.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.uid.trim().is_empty() {
            return Err(HarvestError::InvalidResponse(
                "credential record with empty uid".to_string(),
            ));
        }
        if let Some(name) = missing_required_cookie(&self.cookies) {
            return Err(ValidationFailure::MissingCookie {
                name: name.to_string(),
            }
            .into());
        }
        if self.validated_at < self.fetched_at {
            return Err(HarvestError::InvalidTime(
                "validated_at precedes fetched_at".to_string(),
            ));
        }
        Ok(())
    }
}

/// First required cookie name absent from `cookies`, if any.
#[must_use]
pub fn missing_required_cookie(cookies: &CookieMap) -> Option<&'static str> {
    REQUIRED_COOKIES
        .into_iter()
        .find(|name| !cookies.contains_key(*name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie_set() -> CookieMap {
        let mut cookies = CookieMap::new();
        cookies.insert("SUB".into(), "token".into());
        cookies.insert("SUBP".into(), "pair".into());
        cookies
    }

    #[test]
    fn full_cookie_set_passes() {
        let record = CredentialRecord::new("42", cookie_set(), Utc::now(), None);
        record.ensure_valid().unwrap();
        assert_eq!(record.storage_key("weibo"), "weibo:cookies:42");
    }

    #[test]
    fn missing_pair_cookie_is_named() {
        let mut cookies = cookie_set();
        cookies.remove("SUBP");
        assert_eq!(missing_required_cookie(&cookies), Some("SUBP"));

        let record = CredentialRecord::new("42", cookies, Utc::now(), None);
        let err = record.ensure_valid().unwrap_err();
        assert_eq!(err.code(), "MissingCookie");
    }

    #[test]
    fn empty_uid_rejected() {
        let record = CredentialRecord::new("  ", cookie_set(), Utc::now(), None);
        assert!(record.ensure_valid().is_err());
    }
}
