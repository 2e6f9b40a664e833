//! Logical-client construction, failover, and the one stable façade.
//!
//! For each configured role the orchestrator constructs the socket
//! adapter first and falls back to the browser-automation adapter when
//! construction or the first connect fails. If both fail the logical
//! client is terminal `Failed` and the error propagates — there is no
//! silent no-op fallback. Business code only ever sees
//! [`LogicalClient`], which satisfies the full transport contract
//! regardless of which implementation is active.
//!
//! Two outbound disciplines are distinct named operations:
//! [`LogicalClient::send_best_effort`] (no wait, log-and-continue) and
//! [`LogicalClient::send_ordered`] (wait for readiness, propagate
//! failure).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::aggregator::{EventAggregator, MessageHandler};
use crate::transport::{
    ConnectionState, OutboundContent, SendOptions, SendReceipt, Transport, TransportError,
    TransportEvent, TransportKind,
};

/// Buffer for adapter → orchestrator events.
const EVENT_BUFFER: usize = 128;

/// Lifecycle of one logical client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not yet constructed.
    Init,
    /// Adapter construction in progress (primary, then secondary).
    Constructing,
    /// Active adapter reported ready.
    Ready,
    /// Active adapter lost its connection.
    Disconnected,
    /// A reconnect (adapter-internal or orchestrator-driven) is running.
    Reconnecting,
    /// Terminal: both adapters failed, reconnection gave up, or the
    /// adapter reported a disconnect it cannot recover from.
    Failed,
}

/// Constructs one adapter wired to the given event sender, connected
/// and ready to use. Injectable so failover is testable without a
/// network.
pub type TransportFactory = Box<
    dyn Fn(mpsc::Sender<TransportEvent>) -> BoxFuture<'static, Result<Arc<dyn Transport>, TransportError>>
        + Send
        + Sync,
>;

/// Primary and secondary adapter factories for one logical client.
pub struct TransportFactories {
    /// Tried first.
    pub socket: TransportFactory,
    /// Fallback when the primary fails to construct or connect.
    pub web: TransportFactory,
}

/// Bounds for the orchestrator-driven web reconnect.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts before the client goes terminal `Failed`.
    pub attempts: u32,
    /// Sleep between attempts.
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

/// One configured identity/role, backed by whichever adapter the
/// orchestrator managed to construct.
pub struct LogicalClient {
    role: String,
    transport: Arc<dyn Transport>,
    state_tx: watch::Sender<ClientState>,
    handler: Mutex<Option<MessageHandler>>,
    aggregator: Arc<EventAggregator>,
    reconnect: ReconnectPolicy,
    reconnecting: AtomicBool,
}

/// Build a logical client for `role`: socket first, web on failure,
/// error out when both fail.
///
/// # Errors
///
/// Returns the secondary adapter's construction error when neither
/// adapter could be built; the client is then terminal `Failed`.
pub async fn build_logical_client(
    role: &str,
    factories: &TransportFactories,
    aggregator: Arc<EventAggregator>,
    reconnect: ReconnectPolicy,
) -> Result<Arc<LogicalClient>, TransportError> {
    let (state_tx, _) = watch::channel(ClientState::Init);
    state_tx.send_replace(ClientState::Constructing);

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let (transport, events_rx) = match (factories.socket)(events_tx).await {
        Ok(transport) => {
            info!(role, "logical client backed by socket adapter");
            (transport, events_rx)
        }
        Err(primary_err) => {
            warn!(role, error = %primary_err, "socket adapter failed, falling back to web adapter");
            let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
            match (factories.web)(events_tx).await {
                Ok(transport) => {
                    info!(role, "logical client backed by web adapter");
                    (transport, events_rx)
                }
                Err(secondary_err) => {
                    error!(
                        role,
                        primary = %primary_err,
                        secondary = %secondary_err,
                        "both adapters failed to construct"
                    );
                    state_tx.send_replace(ClientState::Failed);
                    return Err(secondary_err);
                }
            }
        }
    };

    let client = Arc::new(LogicalClient {
        role: role.to_owned(),
        transport,
        state_tx,
        handler: Mutex::new(None),
        aggregator,
        reconnect,
        reconnecting: AtomicBool::new(false),
    });

    tokio::spawn(pump_events(Arc::clone(&client), events_rx));
    Ok(client)
}

impl LogicalClient {
    /// The configured role name.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Which implementation currently backs this client.
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Current lifecycle state.
    pub fn client_state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    /// Live connection state of the backing adapter.
    pub async fn connection_state(&self) -> ConnectionState {
        self.transport.state().await
    }

    /// Point-in-time readiness of the backing adapter.
    pub async fn is_ready(&self) -> bool {
        self.transport.is_ready().await
    }

    /// Register the one business handler. A later registration
    /// deterministically replaces the earlier one.
    pub async fn set_message_handler(&self, handler: MessageHandler) {
        let mut slot = self.handler.lock().await;
        if slot.is_some() {
            warn!(role = %self.role, "replacing previously registered message handler");
        }
        *slot = Some(handler);
    }

    /// Suspend until the active adapter reports ready. No built-in
    /// timeout; a caller that abandons the wait just drops the future.
    pub async fn wait_until_ready(&self) {
        if self.transport.is_ready().await {
            return;
        }
        let mut rx = self.state_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == ClientState::Ready {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped: no more transitions are coming.
                // Fall back to the live probe so we cannot miss a
                // readiness that already happened.
                if self.transport.is_ready().await {
                    return;
                }
                futures_util::future::pending::<()>().await;
            }
        }
    }

    /// Fire-and-forget send: no readiness wait, failures logged and
    /// swallowed.
    pub async fn send_best_effort(&self, jid: &str, content: OutboundContent, options: SendOptions) {
        if let Err(e) = self.transport.send_message(jid, content, options).await {
            warn!(role = %self.role, jid, error = %e, "best-effort send failed");
        }
    }

    /// Ordered send: await readiness first, propagate failures to the
    /// caller. For call sites needing delivery-ordering guarantees.
    ///
    /// # Errors
    ///
    /// Returns the transport's error when the send is rejected.
    pub async fn send_ordered(
        &self,
        jid: &str,
        content: OutboundContent,
        options: SendOptions,
    ) -> Result<SendReceipt, TransportError> {
        self.wait_until_ready().await;
        self.transport.send_message(jid, content, options).await
    }

    /// Tear down the backing adapter.
    ///
    /// # Errors
    ///
    /// Returns the transport's error when teardown fails.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.transport.disconnect().await
    }
}

/// Forward adapter events into client state and the aggregator.
async fn pump_events(client: Arc<LogicalClient>, mut events_rx: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events_rx.recv().await {
        match event {
            TransportEvent::Ready => {
                client.state_tx.send_replace(ClientState::Ready);
            }
            TransportEvent::Disconnected { reason, terminal } => {
                info!(
                    role = %client.role,
                    reason = reason.as_deref().unwrap_or("-"),
                    terminal,
                    "adapter disconnected"
                );
                if terminal {
                    // The adapter will not reconnect; only operator
                    // action (re-pairing) can recover this client.
                    error!(role = %client.role, "adapter gave up permanently, client failed");
                    client.state_tx.send_replace(ClientState::Failed);
                    continue;
                }
                client.state_tx.send_replace(ClientState::Disconnected);
                match client.kind() {
                    // The socket adapter reconnects internally.
                    TransportKind::Socket => {
                        client.state_tx.send_replace(ClientState::Reconnecting);
                    }
                    // The web adapter needs an external, bounded retry.
                    TransportKind::Web => {
                        if !client.reconnecting.swap(true, Ordering::SeqCst) {
                            client.state_tx.send_replace(ClientState::Reconnecting);
                            tokio::spawn(web_reconnect(Arc::clone(&client)));
                        }
                    }
                }
            }
            TransportEvent::Message(raw) => {
                let handler = client.handler.lock().await.clone();
                match handler {
                    Some(handler) => {
                        client.aggregator.handle_incoming(raw, handler, false).await;
                    }
                    None => {
                        debug!(role = %client.role, "no message handler registered, dropping event");
                    }
                }
            }
        }
    }
    debug!(role = %client.role, "adapter event channel closed");
}

/// Bounded external retry for the web adapter.
async fn web_reconnect(client: Arc<LogicalClient>) {
    for attempt in 1..=client.reconnect.attempts {
        tokio::time::sleep(client.reconnect.backoff).await;
        match client.transport.connect().await {
            Ok(()) => {
                info!(role = %client.role, attempt, "web adapter reconnected");
                client.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                warn!(role = %client.role, attempt, error = %e, "web reconnect attempt failed");
            }
        }
    }
    error!(
        role = %client.role,
        attempts = client.reconnect.attempts,
        "web reconnect attempts exhausted, client failed"
    );
    client.state_tx.send_replace(ClientState::Failed);
    client.reconnecting.store(false, Ordering::SeqCst);
}
