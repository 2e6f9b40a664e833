//! Cross-adapter dedup behavior under controlled time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use waygate::aggregator::{AggregatorConfig, EventAggregator, MessageHandler};
use waygate::transport::{InboundMessage, RawMessageEvent, TransportKind};

fn test_config() -> AggregatorConfig {
    AggregatorConfig {
        delay: Duration::from_millis(200),
        seen_ttl: Duration::from_secs(300),
        low_priority: TransportKind::Web,
    }
}

fn event(source: TransportKind, message_id: Option<&str>) -> RawMessageEvent {
    RawMessageEvent {
        source,
        chat_id: Some("5531987654321@s.whatsapp.net".to_owned()),
        message_id: message_id.map(str::to_owned),
        body: "meeting at 3?".to_owned(),
        push_name: Some("Ana".to_owned()),
        timestamp: Utc::now(),
    }
}

/// Handler that records every delivery it receives.
fn recording_handler() -> (MessageHandler, Arc<Mutex<Vec<InboundMessage>>>) {
    let log: Arc<Mutex<Vec<InboundMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let handler: MessageHandler = Arc::new(move |message| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            match sink.lock() {
                Ok(mut entries) => entries.push(message),
                Err(_) => panic!("recording log poisoned"),
            }
            Ok(())
        })
    });
    (handler, log)
}

fn delivered(log: &Arc<Mutex<Vec<InboundMessage>>>) -> usize {
    match log.lock() {
        Ok(entries) => entries.len(),
        Err(_) => panic!("recording log poisoned"),
    }
}

#[tokio::test(start_paused = true)]
async fn high_priority_event_delivered_immediately() {
    let aggregator = EventAggregator::new(test_config());
    let (handler, log) = recording_handler();

    aggregator
        .handle_incoming(event(TransportKind::Socket, Some("m1")), handler, false)
        .await;

    assert_eq!(delivered(&log), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_across_adapters_delivered_exactly_once() {
    let aggregator = EventAggregator::new(test_config());
    let (handler, log) = recording_handler();

    // Socket wins the race; the web copy of the same message arrives
    // 50ms later and must be absorbed.
    aggregator
        .handle_incoming(
            event(TransportKind::Socket, Some("m1")),
            Arc::clone(&handler),
            false,
        )
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    aggregator
        .handle_incoming(event(TransportKind::Web, Some("m1")), handler, false)
        .await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(delivered(&log), 1);
}

#[tokio::test(start_paused = true)]
async fn web_arrival_first_superseded_by_socket_within_window() {
    let aggregator = EventAggregator::new(test_config());
    let (handler, log) = recording_handler();

    // Web copy arrives first and is held.
    aggregator
        .handle_incoming(
            event(TransportKind::Web, Some("m2")),
            Arc::clone(&handler),
            false,
        )
        .await;
    assert_eq!(delivered(&log), 0, "low-priority arrival must be held");

    // Socket copy lands inside the hold window and claims the key.
    tokio::time::sleep(Duration::from_millis(50)).await;
    aggregator
        .handle_incoming(event(TransportKind::Socket, Some("m2")), handler, false)
        .await;
    assert_eq!(delivered(&log), 1);

    // When the window elapses the held web copy is dropped.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(delivered(&log), 1);
}

#[tokio::test(start_paused = true)]
async fn unique_web_event_delivered_after_hold_window() {
    let aggregator = EventAggregator::new(test_config());
    let (handler, log) = recording_handler();

    aggregator
        .handle_incoming(event(TransportKind::Web, Some("m3")), handler, false)
        .await;
    assert_eq!(delivered(&log), 0);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(delivered(&log), 1, "undelayed web-only message was lost");
}

#[tokio::test(start_paused = true)]
async fn allow_replay_bypasses_seen_check() {
    let aggregator = EventAggregator::new(test_config());
    let (handler, log) = recording_handler();

    aggregator
        .handle_incoming(
            event(TransportKind::Socket, Some("m4")),
            Arc::clone(&handler),
            false,
        )
        .await;
    aggregator
        .handle_incoming(event(TransportKind::Socket, Some("m4")), handler, true)
        .await;

    assert_eq!(delivered(&log), 2);
}

#[tokio::test(start_paused = true)]
async fn events_without_ids_are_never_deduplicated() {
    let aggregator = EventAggregator::new(test_config());
    let (handler, log) = recording_handler();

    aggregator
        .handle_incoming(event(TransportKind::Socket, None), Arc::clone(&handler), false)
        .await;
    aggregator
        .handle_incoming(event(TransportKind::Socket, None), handler, false)
        .await;

    assert_eq!(delivered(&log), 2);
}

#[tokio::test(start_paused = true)]
async fn handler_error_does_not_block_later_events() {
    let aggregator = EventAggregator::new(test_config());

    let failing: MessageHandler =
        Arc::new(|_| Box::pin(async { Err(anyhow::anyhow!("downstream exploded")) }));
    aggregator
        .handle_incoming(event(TransportKind::Socket, Some("m5")), failing, false)
        .await;

    let (handler, log) = recording_handler();
    aggregator
        .handle_incoming(event(TransportKind::Socket, Some("m6")), handler, false)
        .await;

    assert_eq!(delivered(&log), 1);
}

#[tokio::test(start_paused = true)]
async fn seen_keys_eventually_expire() {
    let aggregator = EventAggregator::new(test_config());
    let (handler, log) = recording_handler();

    aggregator
        .handle_incoming(
            event(TransportKind::Socket, Some("m7")),
            Arc::clone(&handler),
            false,
        )
        .await;
    assert_eq!(aggregator.seen_len().await, 1);

    // Past two full TTL generations the key is evicted and the same id
    // would deliver again (a deliberate trade against unbounded memory).
    tokio::time::sleep(Duration::from_secs(700)).await;
    aggregator
        .handle_incoming(event(TransportKind::Socket, Some("m7")), handler, false)
        .await;

    assert_eq!(delivered(&log), 2);
}
