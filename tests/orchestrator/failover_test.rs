//! Adapter failover and the logical-client façade, with mock factories.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use waygate::aggregator::{AggregatorConfig, EventAggregator, MessageHandler};
use waygate::orchestrator::{
    build_logical_client, ClientState, ReconnectPolicy, TransportFactories, TransportFactory,
};
use waygate::transport::{
    ConnectionState, InboundMessage, OutboundContent, RawMessageEvent, SendOptions, SendReceipt,
    Transport, TransportError, TransportEvent, TransportKind,
};

struct MockTransport {
    kind: TransportKind,
    fail_sends: bool,
    sends: AtomicUsize,
}

impl MockTransport {
    fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            fail_sends: false,
            sends: AtomicUsize::new(0),
        }
    }

    fn failing_sends(kind: TransportKind) -> Self {
        Self {
            kind,
            fail_sends: true,
            sends: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_message(
        &self,
        jid: &str,
        _content: OutboundContent,
        _options: SendOptions,
    ) -> Result<SendReceipt, TransportError> {
        if self.fail_sends {
            return Err(TransportError::SendFailed {
                jid: jid.to_owned(),
                reason: "mock rejection".to_owned(),
            });
        }
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(SendReceipt {
            message_id: "3EB0MOCK".to_owned(),
            timestamp: Utc::now(),
        })
    }

    async fn is_ready(&self) -> bool {
        true
    }

    async fn state(&self) -> ConnectionState {
        ConnectionState::Open
    }
}

/// Factory yielding a working mock of the given kind. Stashes the
/// event sender so the test can inject adapter events afterwards.
fn working_factory(
    kind: TransportKind,
    sender_slot: Arc<Mutex<Option<mpsc::Sender<TransportEvent>>>>,
) -> TransportFactory {
    Box::new(move |events| {
        let sender_slot = Arc::clone(&sender_slot);
        Box::pin(async move {
            if let Ok(mut slot) = sender_slot.lock() {
                *slot = Some(events);
            }
            let transport: Arc<dyn Transport> = Arc::new(MockTransport::new(kind));
            Ok(transport)
        })
    })
}

fn broken_factory(reason: &str) -> TransportFactory {
    let reason = reason.to_owned();
    Box::new(move |_events| {
        let reason = reason.clone();
        Box::pin(async move { Err(TransportError::Connection(reason)) })
    })
}

fn unused_slot() -> Arc<Mutex<Option<mpsc::Sender<TransportEvent>>>> {
    Arc::new(Mutex::new(None))
}

fn aggregator() -> Arc<EventAggregator> {
    Arc::new(EventAggregator::new(AggregatorConfig::default()))
}

fn take_sender(
    slot: &Arc<Mutex<Option<mpsc::Sender<TransportEvent>>>>,
) -> mpsc::Sender<TransportEvent> {
    match slot.lock() {
        Ok(mut guard) => guard.take().expect("factory should have stashed the sender"),
        Err(_) => panic!("sender slot poisoned"),
    }
}

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

#[tokio::test]
async fn socket_adapter_is_preferred_when_it_constructs() {
    let factories = TransportFactories {
        socket: working_factory(TransportKind::Socket, unused_slot()),
        web: working_factory(TransportKind::Web, unused_slot()),
    };

    let client = build_logical_client(
        "primary",
        &factories,
        aggregator(),
        ReconnectPolicy::default(),
    )
    .await
    .expect("client should build");

    assert_eq!(client.kind(), TransportKind::Socket);
}

#[tokio::test]
async fn falls_back_to_web_when_socket_fails() {
    let factories = TransportFactories {
        socket: broken_factory("gateway unreachable"),
        web: working_factory(TransportKind::Web, unused_slot()),
    };

    let client = build_logical_client(
        "primary",
        &factories,
        aggregator(),
        ReconnectPolicy::default(),
    )
    .await
    .expect("fallback should succeed");

    assert_eq!(client.kind(), TransportKind::Web);
    assert!(client.is_ready().await);
}

#[tokio::test]
async fn error_propagates_when_both_adapters_fail() {
    let factories = TransportFactories {
        socket: broken_factory("gateway unreachable"),
        web: broken_factory("bridge unreachable"),
    };

    let result = build_logical_client(
        "primary",
        &factories,
        aggregator(),
        ReconnectPolicy::default(),
    )
    .await;

    match result {
        Err(TransportError::Connection(reason)) => assert_eq!(reason, "bridge unreachable"),
        Err(other) => panic!("expected secondary construction error, got {other:?}"),
        Ok(_) => panic!("construction should have failed"),
    }
}

#[tokio::test]
async fn ready_event_drives_client_state() {
    let slot = unused_slot();
    let factories = TransportFactories {
        socket: working_factory(TransportKind::Socket, Arc::clone(&slot)),
        web: broken_factory("unused"),
    };

    let client = build_logical_client(
        "primary",
        &factories,
        aggregator(),
        ReconnectPolicy::default(),
    )
    .await
    .expect("client should build");
    assert_eq!(client.client_state(), ClientState::Constructing);

    let events = take_sender(&slot);
    events.send(TransportEvent::Ready).await.expect("send event");
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(client.client_state(), ClientState::Ready);
    client.wait_until_ready().await;
}

#[tokio::test]
async fn send_ordered_returns_receipt() {
    let factories = TransportFactories {
        socket: working_factory(TransportKind::Socket, unused_slot()),
        web: broken_factory("unused"),
    };

    let client = build_logical_client(
        "primary",
        &factories,
        aggregator(),
        ReconnectPolicy::default(),
    )
    .await
    .expect("client should build");

    let receipt = client
        .send_ordered(
            "5531987654321@s.whatsapp.net",
            OutboundContent::Text("olá".to_owned()),
            SendOptions::default(),
        )
        .await
        .expect("ordered send should succeed");

    assert_eq!(receipt.message_id, "3EB0MOCK");
}

#[tokio::test]
async fn send_best_effort_swallows_rejections() {
    let factories = TransportFactories {
        socket: Box::new(|_events| {
            Box::pin(async {
                let transport: Arc<dyn Transport> =
                    Arc::new(MockTransport::failing_sends(TransportKind::Socket));
                Ok(transport)
            })
        }),
        web: broken_factory("unused"),
    };

    let client = build_logical_client(
        "primary",
        &factories,
        aggregator(),
        ReconnectPolicy::default(),
    )
    .await
    .expect("client should build");

    // Completes without error despite the transport rejecting it.
    client
        .send_best_effort(
            "5531987654321@s.whatsapp.net",
            OutboundContent::Text("olá".to_owned()),
            SendOptions::default(),
        )
        .await;
}

#[tokio::test]
async fn inbound_duplicates_reach_handler_once() {
    let slot = unused_slot();
    let factories = TransportFactories {
        socket: working_factory(TransportKind::Socket, Arc::clone(&slot)),
        web: broken_factory("unused"),
    };

    let client = build_logical_client(
        "primary",
        &factories,
        aggregator(),
        ReconnectPolicy::default(),
    )
    .await
    .expect("client should build");

    let (handler, log) = recording_handler();
    client.set_message_handler(handler).await;

    let raw = RawMessageEvent {
        source: TransportKind::Socket,
        chat_id: Some("5531987654321@s.whatsapp.net".to_owned()),
        message_id: Some("m1".to_owned()),
        body: "hi".to_owned(),
        push_name: None,
        timestamp: Utc::now(),
    };
    let events = take_sender(&slot);
    events
        .send(TransportEvent::Message(raw.clone()))
        .await
        .expect("send event");
    events
        .send(TransportEvent::Message(raw))
        .await
        .expect("send event");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let count = match log.lock() {
        Ok(entries) => entries.len(),
        Err(_) => panic!("recording log poisoned"),
    };
    assert_eq!(count, 1);
}

#[tokio::test]
async fn socket_disconnect_marks_client_reconnecting() {
    let slot = unused_slot();
    let factories = TransportFactories {
        socket: working_factory(TransportKind::Socket, Arc::clone(&slot)),
        web: broken_factory("unused"),
    };

    let client = build_logical_client(
        "primary",
        &factories,
        aggregator(),
        ReconnectPolicy::default(),
    )
    .await
    .expect("client should build");

    let events = take_sender(&slot);
    events
        .send(TransportEvent::Disconnected {
            reason: Some("stream errored".to_owned()),
            terminal: false,
        })
        .await
        .expect("send event");
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The socket adapter resockets internally; the client reports that.
    assert_eq!(client.client_state(), ClientState::Reconnecting);
}

#[tokio::test]
async fn terminal_disconnect_marks_client_failed() {
    let slot = unused_slot();
    let factories = TransportFactories {
        socket: working_factory(TransportKind::Socket, Arc::clone(&slot)),
        web: broken_factory("unused"),
    };

    let client = build_logical_client(
        "primary",
        &factories,
        aggregator(),
        ReconnectPolicy::default(),
    )
    .await
    .expect("client should build");

    let events = take_sender(&slot);
    events
        .send(TransportEvent::Disconnected {
            reason: Some("device removed".to_owned()),
            terminal: true,
        })
        .await
        .expect("send event");
    // The adapter gives up and closes its event channel too.
    drop(events);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // No reconnect follows; the client is done until re-pairing.
    assert_eq!(client.client_state(), ClientState::Failed);
}
