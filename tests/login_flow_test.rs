//! Login state machine and event fan-out behaviour.

use std::time::Duration;

use weibo_harvester::events::{EventBus, HarvestEvent, LoginEvent, LoginEventType};
use weibo_harvester::login::{LoginSession, LoginState, Transition};
use weibo_harvester::sidecar::CookieMap;

fn cookies() -> CookieMap {
    let mut map = CookieMap::new();
    map.insert("SUB".into(), "t".into());
    map.insert("SUBP".into(), "s".into());
    map
}

/// Event ordering within one session: every subscriber observes
/// QrGenerated before QrScanned before Confirmed before ValidationSuccess.
#[tokio::test]
async fn subscribers_observe_login_sequence_in_order() {
    let bus = EventBus::default();
    let mut rx_a = bus.subscribe();
    let mut rx_b = bus.subscribe();

    for event_type in [
        LoginEventType::QrGenerated,
        LoginEventType::QrScanned,
        LoginEventType::Confirmed,
        LoginEventType::ValidationSuccess,
    ] {
        bus.publish(HarvestEvent::LoginStatus(LoginEvent::new(event_type, "s-1")));
    }

    for rx in [&mut rx_a, &mut rx_b] {
        let mut seen = Vec::new();
        for _ in 0..4 {
            match rx.recv().await.unwrap() {
                HarvestEvent::LoginStatus(event) => seen.push(event.event_type),
                other => panic!("unexpected event on {}", other.topic()),
            }
        }
        assert_eq!(
            seen,
            vec![
                LoginEventType::QrGenerated,
                LoginEventType::QrScanned,
                LoginEventType::Confirmed,
                LoginEventType::ValidationSuccess,
            ]
        );
    }
}

/// Validation success is unreachable without a prior Confirmed: the machine
/// refuses the transition from every earlier state.
#[test]
fn validation_success_requires_confirmed() {
    let mut session = LoginSession::new("qr-1", "img", Duration::from_secs(180));
    assert!(session
        .apply(Transition::ValidationSucceeded { uid: "42".into() })
        .is_err());

    session.apply(Transition::Scanned).unwrap();
    assert!(session
        .apply(Transition::ValidationSucceeded { uid: "42".into() })
        .is_err());

    session.apply(Transition::Confirmed { cookies: cookies() }).unwrap();
    session
        .apply(Transition::ValidationSucceeded { uid: "42".into() })
        .unwrap();
    assert_eq!(session.state, LoginState::Stored);
}

/// Expiry is terminal and absorbs exactly one transition; a second expiry
/// attempt is rejected, so the orchestrator can never emit QrExpired twice.
#[test]
fn expiry_fires_once() {
    let mut session = LoginSession::new("qr-1", "img", Duration::from_secs(180));
    assert!(session.apply(Transition::Expired).is_ok());
    assert!(session.apply(Transition::Expired).is_err());
    assert_eq!(session.state, LoginState::Expired);
}

/// Rejection from the phone lands in a terminal Rejected state from either
/// waiting state, but not after validation began.
#[test]
fn rejection_only_before_validation() {
    let mut session = LoginSession::new("qr-1", "img", Duration::from_secs(180));
    session.apply(Transition::Scanned).unwrap();
    session.apply(Transition::Confirmed { cookies: cookies() }).unwrap();
    // Validating: the user can no longer reject on the phone.
    assert!(session.apply(Transition::Rejected).is_err());
}

/// A refresh mid-wait keeps the same session id but extends the deadline —
/// the expiry timer must follow the new deadline.
#[test]
fn refresh_moves_expiry_forward() {
    let mut session = LoginSession::new("qr-1", "img-1", Duration::from_secs(5));
    let first_deadline = session.expires_at;
    session.refresh("img-2", Duration::from_secs(180)).unwrap();
    assert!(session.expires_at > first_deadline);
    assert!(!session.is_expired_at(first_deadline));
}
