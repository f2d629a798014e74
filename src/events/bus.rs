//! Broadcast event bus
//!
//! One-way publish from back-end components to the UI consumer. Delivery is
//! best-effort over a bounded broadcast channel: a slow consumer loses the
//! oldest events, and publishing never fails the producer. Producers bound
//! their own emission rate (the crawl engine caps progress at 10 Hz), so the
//! bus itself needs no backpressure modes.

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace};

use super::types::HarvestEvent;

/// Default channel capacity; login traffic is bounded by the state machine
/// and crawl progress is rate-capped, so this absorbs any realistic burst.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Event bus handle. Cheap to clone via `Arc` at the call sites.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<HarvestEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Lossy by contract: an absent consumer drops the event silently and
    /// the producer continues.
    pub fn publish(&self, event: HarvestEvent) {
        let topic = event.topic();
        match self.sender.send(event) {
            Ok(receivers) => trace!(topic, receivers, "event published"),
            Err(_) => debug!(topic, "event dropped, no subscribers"),
        }
    }

    /// Raw broadcast receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HarvestEvent> {
        self.sender.subscribe()
    }

    /// Receiver wrapped as an async stream.
    #[must_use]
    pub fn stream(&self) -> BroadcastStream<HarvestEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{LoginEvent, LoginEventType};

    #[tokio::test]
    async fn publish_without_subscribers_does_not_fail() {
        let bus = EventBus::default();
        bus.publish(HarvestEvent::connection_restored(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_see_identical_sequences() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(HarvestEvent::LoginStatus(LoginEvent::new(
            LoginEventType::QrGenerated,
            "s-1",
        )));
        bus.publish(HarvestEvent::LoginStatus(LoginEvent::new(
            LoginEventType::QrScanned,
            "s-1",
        )));

        for receiver in [&mut first, &mut second] {
            let a = receiver.recv().await.unwrap();
            let b = receiver.recv().await.unwrap();
            assert_eq!(a.topic(), "login_status_update");
            assert_eq!(b.topic(), "login_status_update");
        }
    }
}
