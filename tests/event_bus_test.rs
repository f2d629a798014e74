//! Event bus delivery contract.

use chrono::{TimeZone, Utc};
use uuid::Uuid;
use weibo_harvester::crawl::{TaskStatus, TimeRange};
use weibo_harvester::events::{CrawlProgress, EventBus, HarvestEvent};

fn progress(task_id: Uuid, page: u32) -> HarvestEvent {
    let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
    HarvestEvent::CrawlProgress(CrawlProgress {
        task_id,
        status: TaskStatus::HistoryCrawling,
        current_range: TimeRange::new(start, start + chrono::Duration::hours(2)).unwrap(),
        current_page: page,
        crawled_count: u64::from(page) * 20,
        timestamp: Utc::now(),
    })
}

#[test]
fn topics_are_stable_strings() {
    let task_id = Uuid::new_v4();
    assert_eq!(progress(task_id, 1).topic(), "crawl_progress");
    assert_eq!(
        HarvestEvent::crawl_completed(task_id, 10).topic(),
        "crawl_completed"
    );
    assert_eq!(
        HarvestEvent::crawl_error(task_id, "CaptchaDetected", "captcha").topic(),
        "crawl_error"
    );
    assert_eq!(
        HarvestEvent::connection_lost(false, 1).topic(),
        "websocket_connection_lost"
    );
    assert_eq!(
        HarvestEvent::connection_restored(2).topic(),
        "websocket_connection_restored"
    );
}

/// A consumer that falls behind loses the oldest events but the producer
/// never observes an error.
#[tokio::test]
async fn slow_consumer_drops_oldest_without_failing_producer() {
    let bus = EventBus::new(8);
    let mut rx = bus.subscribe();

    let task_id = Uuid::new_v4();
    for page in 1..=50 {
        bus.publish(progress(task_id, page));
    }

    // The first recv reports the lag, subsequent receives drain the most
    // recent events in order.
    let mut received = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(HarvestEvent::CrawlProgress(p)) => received.push(p.current_page),
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    assert!(!received.is_empty());
    assert!(received.len() <= 8);
    assert!(received.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(*received.last().unwrap(), 50);
}

/// Progress payloads serialize with their entity id and timestamp, as the
/// front end expects.
#[test]
fn progress_payload_carries_task_and_timestamp() {
    let task_id = Uuid::new_v4();
    let value = serde_json::to_value(progress(task_id, 7)).unwrap();
    let payload = &value["CrawlProgress"];
    assert_eq!(payload["task_id"], serde_json::json!(task_id));
    assert_eq!(payload["current_page"], 7);
    assert!(payload["timestamp"].is_string());
}
