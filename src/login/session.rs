//! QR login session state machine
//!
//! One in-memory record per login attempt, driven by control-channel
//! messages. Transitions are one-way along
//! WaitingForScan → WaitingForConfirm → Validating → Stored, with
//! Expired/Rejected/Failed reachable from any non-terminal state.
//! Modelling this explicitly (rather than as nested awaits) keeps
//! reconnection and cancellation tractable.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};
use crate::sidecar::CookieMap;

/// Orchestrator-visible session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    WaitingForScan,
    WaitingForConfirm,
    Validating,
    Stored,
    Failed,
    Expired,
    Rejected,
}

impl LoginState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Stored | Self::Failed | Self::Expired | Self::Rejected
        )
    }
}

/// State machine inputs.
#[derive(Debug, Clone)]
pub enum Transition {
    Scanned,
    Confirmed { cookies: CookieMap },
    ValidationSucceeded { uid: String },
    ValidationFailed { code: String },
    Rejected,
    Expired,
    Failed { code: String },
}

/// One live login attempt.
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub qr_id: String,
    pub state: LoginState,
    /// Base64 PNG, replaced on auto-refresh
    pub qr_image: String,
    pub created_at: DateTime<Utc>,
    pub scanned_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Captured on Confirmed, consumed by validation
    pub cookies: Option<CookieMap>,
    /// Set on Stored
    pub uid: Option<String>,
    /// Failure code for Failed / Rejected
    pub failure: Option<String>,
}

impl LoginSession {
    #[must_use]
    pub fn new(qr_id: impl Into<String>, qr_image: impl Into<String>, expires_in: std::time::Duration) -> Self {
        let now = Utc::now();
        Self {
            qr_id: qr_id.into(),
            state: LoginState::WaitingForScan,
            qr_image: qr_image.into(),
            created_at: now,
            scanned_at: None,
            confirmed_at: None,
            expires_at: now
                + ChronoDuration::from_std(expires_in).unwrap_or(ChronoDuration::seconds(180)),
            updated_at: now,
            cookies: None,
            uid: None,
            failure: None,
        }
    }

    /// Apply a transition, enforcing the one-way machine.
    pub fn apply(&mut self, transition: Transition) -> Result<()> {
        let now = Utc::now();
        match (&self.state, transition) {
            (LoginState::WaitingForScan, Transition::Scanned) => {
                self.state = LoginState::WaitingForConfirm;
                self.scanned_at = Some(now);
            }
            (LoginState::WaitingForConfirm, Transition::Confirmed { cookies }) => {
                self.state = LoginState::Validating;
                self.confirmed_at = Some(now);
                self.cookies = Some(cookies);
            }
            (LoginState::Validating, Transition::ValidationSucceeded { uid }) => {
                self.state = LoginState::Stored;
                self.uid = Some(uid);
            }
            (LoginState::Validating, Transition::ValidationFailed { code }) => {
                self.state = LoginState::Failed;
                self.failure = Some(code);
            }
            (state, Transition::Rejected) if !state.is_terminal() => {
                self.state = LoginState::Rejected;
                self.failure = Some("rejected".to_string());
            }
            (state, Transition::Expired) if !state.is_terminal() => {
                self.state = LoginState::Expired;
            }
            (state, Transition::Failed { code }) if !state.is_terminal() => {
                self.state = LoginState::Failed;
                self.failure = Some(code);
            }
            (state, transition) => {
                return Err(HarvestError::InvalidStatus {
                    wanted: transition_name(&transition),
                    actual: format!("{state:?}"),
                });
            }
        }
        self.updated_at = now;
        Ok(())
    }

    /// Absorb an auto-refreshed QR: same session, new image and deadline.
    /// Only meaningful before a scan was confirmed.
    pub fn refresh(&mut self, qr_image: impl Into<String>, expires_in: std::time::Duration) -> Result<()> {
        if self.state.is_terminal() || self.state == LoginState::Validating {
            return Err(HarvestError::InvalidStatus {
                wanted: "refresh",
                actual: format!("{:?}", self.state),
            });
        }
        let now = Utc::now();
        self.qr_image = qr_image.into();
        self.expires_at =
            now + ChronoDuration::from_std(expires_in).unwrap_or(ChronoDuration::seconds(180));
        self.updated_at = now;
        Ok(())
    }

    /// Expiry check; a session exactly at `expires_at` has expired.
    #[must_use]
    pub fn is_expired_at(&self, instant: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && instant >= self.expires_at
    }
}

fn transition_name(transition: &Transition) -> &'static str {
    match transition {
        Transition::Scanned => "scanned",
        Transition::Confirmed { .. } => "confirmed",
        Transition::ValidationSucceeded { .. } => "validation_succeeded",
        Transition::ValidationFailed { .. } => "validation_failed",
        Transition::Rejected => "rejected",
        Transition::Expired => "expired",
        Transition::Failed { .. } => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cookies() -> CookieMap {
        let mut map = CookieMap::new();
        map.insert("SUB".into(), "t".into());
        map.insert("SUBP".into(), "s".into());
        map
    }

    fn fresh() -> LoginSession {
        LoginSession::new("qr-1", "iVBOR...", Duration::from_secs(180))
    }

    #[test]
    fn happy_path_reaches_stored() {
        let mut session = fresh();
        session.apply(Transition::Scanned).unwrap();
        assert_eq!(session.state, LoginState::WaitingForConfirm);
        assert!(session.scanned_at.is_some());

        session
            .apply(Transition::Confirmed { cookies: cookies() })
            .unwrap();
        assert_eq!(session.state, LoginState::Validating);

        session
            .apply(Transition::ValidationSucceeded { uid: "42".into() })
            .unwrap();
        assert_eq!(session.state, LoginState::Stored);
        assert!(session.state.is_terminal());

        // Timestamps are monotone along the path.
        assert!(session.created_at <= session.scanned_at.unwrap());
        assert!(session.scanned_at.unwrap() <= session.confirmed_at.unwrap());
    }

    #[test]
    fn confirm_before_scan_is_illegal() {
        let mut session = fresh();
        let err = session
            .apply(Transition::Confirmed { cookies: cookies() })
            .unwrap_err();
        assert_eq!(err.code(), "InvalidStatus");
        assert_eq!(session.state, LoginState::WaitingForScan);
    }

    #[test]
    fn terminal_states_absorb_nothing() {
        let mut session = fresh();
        session.apply(Transition::Expired).unwrap();
        assert!(session.apply(Transition::Scanned).is_err());
        assert!(session.apply(Transition::Expired).is_err());
    }

    #[test]
    fn rejected_reachable_from_waiting_states() {
        let mut session = fresh();
        session.apply(Transition::Scanned).unwrap();
        session.apply(Transition::Rejected).unwrap();
        assert_eq!(session.state, LoginState::Rejected);
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let session = fresh();
        assert!(!session.is_expired_at(session.expires_at - ChronoDuration::seconds(1)));
        assert!(session.is_expired_at(session.expires_at));
    }

    #[test]
    fn refresh_extends_deadline_and_keeps_id() {
        let mut session = fresh();
        let old_deadline = session.expires_at;
        session.refresh("newimage", Duration::from_secs(300)).unwrap();
        assert!(session.expires_at > old_deadline);
        assert_eq!(session.qr_id, "qr-1");
        assert_eq!(session.qr_image, "newimage");
    }

    #[test]
    fn refresh_after_confirm_is_illegal() {
        let mut session = fresh();
        session.apply(Transition::Scanned).unwrap();
        session
            .apply(Transition::Confirmed { cookies: cookies() })
            .unwrap();
        assert!(session.refresh("img", Duration::from_secs(180)).is_err());
    }

    #[test]
    fn validation_failure_lands_in_failed() {
        let mut session = fresh();
        session.apply(Transition::Scanned).unwrap();
        session
            .apply(Transition::Confirmed { cookies: cookies() })
            .unwrap();
        session
            .apply(Transition::ValidationFailed {
                code: "ProfileApiFailed".into(),
            })
            .unwrap();
        assert_eq!(session.state, LoginState::Failed);
        assert_eq!(session.failure.as_deref(), Some("ProfileApiFailed"));
    }
}
