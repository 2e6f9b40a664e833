//! Socket-protocol adapter: WebSocket client of the protocol gateway.
//!
//! Speaks the framed JSON surface of [`super::wire`] over a single
//! WebSocket. The adapter owns credential custody through
//! [`SessionStore`]: the persisted root blob travels in the `hello`
//! frame, and every `creds`/`keys` rotation frame is persisted before
//! anything else happens. Only `notify` stanzas are forwarded; history
//! replay is discarded at this boundary.
//!
//! Session corruption self-heals without the caller noticing more than
//! a `Disconnected`/`Ready` pair: the supervisor wipes the session
//! directory, discards the socket, and reconnects with empty
//! credentials. Plain connection loss reconnects with capped,
//! jittered exponential backoff. A `logged_out` close is terminal —
//! only re-pairing can recover, so the supervisor stops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::wire::{ClientFrame, ServerFrame, WireContent};
use super::{
    classify_disconnect, ConnectionState, OutboundContent, RawMessageEvent, SendOptions,
    SendReceipt, Transport, TransportError, TransportEvent, TransportKind,
};
use crate::session::SessionStore;

/// Close code the gateway sends when the device was unlinked.
const LOGGED_OUT_CODE: &str = "logged_out";

/// Initial reconnect backoff in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum reconnect backoff in milliseconds.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Random jitter added to each backoff sleep, in milliseconds.
const BACKOFF_JITTER_MS: u64 = 250;

/// Buffer for frames queued toward the writer.
const OUTBOUND_BUFFER: usize = 64;

/// Socket adapter configuration.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Gateway WebSocket endpoint, e.g. `ws://127.0.0.1:3002/ws`.
    pub gateway_url: String,
    /// How long a send may wait for its `ack` frame.
    pub ack_deadline: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            gateway_url: "ws://127.0.0.1:3002/ws".to_owned(),
            ack_deadline: Duration::from_secs(60),
        }
    }
}

type PendingSends = Mutex<HashMap<u64, (String, oneshot::Sender<Result<SendReceipt, TransportError>>)>>;

/// Shared state between the adapter handle and its supervisor task.
struct SocketShared {
    config: SocketConfig,
    /// Credential custody. `None` for the ephemeral pairing instance.
    store: Option<SessionStore>,
    events: mpsc::Sender<TransportEvent>,
    state_tx: watch::Sender<ConnectionState>,
    outbound_tx: mpsc::Sender<ClientFrame>,
    pending: PendingSends,
    pending_pair: Mutex<Option<oneshot::Sender<Result<String, TransportError>>>>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

/// Why one connection lifetime ended.
enum ConnectionEnd {
    /// Shutdown requested or channels closed.
    Shutdown,
    /// Device unlinked; terminal until re-pairing.
    LoggedOut { reason: Option<String> },
    /// Cryptographic session state mismatch; wipe and resocket.
    Corrupt { code: Option<String>, reason: String },
    /// Plain connection loss; retry with backoff.
    Lost { reason: String, was_open: bool },
}

/// The socket-protocol adapter.
pub struct SocketTransport {
    shared: Arc<SocketShared>,
    state_rx: watch::Receiver<ConnectionState>,
    /// Taken by the supervisor on the first `connect()`.
    outbound_rx: Mutex<Option<mpsc::Receiver<ClientFrame>>>,
}

impl SocketTransport {
    /// Create an adapter with credential custody over `store`.
    ///
    /// Inbound events are pushed to `events`; nothing happens until
    /// [`Transport::connect`] is called.
    pub fn new(
        config: SocketConfig,
        store: SessionStore,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self::build(config, Some(store), events)
    }

    /// Create a session-less adapter bound to no prior credentials,
    /// used once by the pairing flow and then torn down.
    pub fn ephemeral(config: SocketConfig, events: mpsc::Sender<TransportEvent>) -> Self {
        Self::build(config, None, events)
    }

    fn build(
        config: SocketConfig,
        store: Option<SessionStore>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Close);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(SocketShared {
                config,
                store,
                events,
                state_tx,
                outbound_tx,
                pending: Mutex::new(HashMap::new()),
                pending_pair: Mutex::new(None),
                next_id: AtomicU64::new(1),
                shutdown_tx,
            }),
            state_rx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    /// Request a numeric device-pairing code for `number`.
    ///
    /// Only meaningful on a connected session-less instance; the code
    /// must be entered on the physical device within its validity
    /// window.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected, if a pairing request is
    /// already outstanding, or if the gateway rejects the request.
    pub async fn request_pairing_code(&self, number: &str) -> Result<String, TransportError> {
        let digits = crate::jid::digits(number);
        if digits.is_empty() {
            return Err(TransportError::Pairing(format!(
                "number {number:?} contains no digits"
            )));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.shared.pending_pair.lock().await;
            if slot.is_some() {
                return Err(TransportError::Pairing(
                    "a pairing request is already outstanding".to_owned(),
                ));
            }
            *slot = Some(tx);
        }

        if self
            .shared
            .outbound_tx
            .send(ClientFrame::Pair { number: digits })
            .await
            .is_err()
        {
            *self.shared.pending_pair.lock().await = None;
            return Err(TransportError::NotConnected);
        }

        match tokio::time::timeout(self.shared.config.ack_deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Pairing("connection lost".to_owned())),
            Err(_) => {
                *self.shared.pending_pair.lock().await = None;
                Err(TransportError::Pairing("pairing code request timed out".to_owned()))
            }
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let Some(outbound_rx) = self.outbound_rx.lock().await.take() else {
            return Err(TransportError::Connection(
                "socket adapter already connected".to_owned(),
            ));
        };

        if let Some(store) = &self.shared.store {
            store
                .ensure_dir()
                .map_err(|e| TransportError::Construction(e.to_string()))?;
        }

        let (first_tx, first_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(supervise(shared, outbound_rx, first_tx));

        first_rx
            .await
            .map_err(|_| TransportError::Connection("supervisor exited before handshake".to_owned()))?
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let _ = self.shared.shutdown_tx.send(true);
        self.shared.state_tx.send_replace(ConnectionState::Close);
        Ok(())
    }

    async fn send_message(
        &self,
        jid: &str,
        content: OutboundContent,
        options: SendOptions,
    ) -> Result<SendReceipt, TransportError> {
        let wire_content = match content {
            OutboundContent::Text(text) => WireContent::Text { text },
            OutboundContent::Document {
                bytes,
                mime_type,
                file_name,
            } => WireContent::Document {
                data_b64: base64::engine::general_purpose::STANDARD.encode(bytes),
                mime_type,
                file_name,
                caption: options.caption,
            },
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(id, (jid.to_owned(), tx));

        let frame = ClientFrame::Send {
            id,
            jid: jid.to_owned(),
            content: wire_content,
        };
        if self.shared.outbound_tx.send(frame).await.is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(TransportError::NotConnected);
        }

        match tokio::time::timeout(self.shared.config.ack_deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(TransportError::SendFailed {
                    jid: jid.to_owned(),
                    reason: "ack deadline exceeded".to_owned(),
                })
            }
        }
    }

    async fn is_ready(&self) -> bool {
        *self.state_rx.borrow() == ConnectionState::Open
    }

    async fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Own the connection across reconnects. Handlers and channels
/// registered on the adapter survive every transition here.
async fn supervise(
    shared: Arc<SocketShared>,
    mut outbound_rx: mpsc::Receiver<ClientFrame>,
    first_tx: oneshot::Sender<Result<(), TransportError>>,
) {
    let mut first = Some(first_tx);
    let mut backoff_ms: u64 = INITIAL_BACKOFF_MS;

    loop {
        let end = run_connection(&shared, &mut outbound_rx, &mut first).await;
        fail_pending(&shared, "connection lost").await;
        shared.state_tx.send_replace(ConnectionState::Close);

        match end {
            ConnectionEnd::Shutdown => {
                debug!("socket supervisor shutting down");
                break;
            }
            ConnectionEnd::LoggedOut { reason } => {
                error!(
                    reason = reason.as_deref().unwrap_or("-"),
                    "device logged out; run the pair flow to re-link"
                );
                emit(
                    &shared,
                    TransportEvent::Disconnected {
                        reason,
                        terminal: true,
                    },
                )
                .await;
                break;
            }
            ConnectionEnd::Corrupt { code, reason } => {
                warn!(
                    code = code.as_deref().unwrap_or("-"),
                    reason, "session corruption detected, wiping session state and reconnecting"
                );
                if let Some(store) = &shared.store {
                    if let Err(e) = store.clear_all() {
                        error!(error = %e, "failed to wipe corrupted session directory");
                    }
                }
                emit(
                    &shared,
                    TransportEvent::Disconnected {
                        reason: Some(reason),
                        terminal: false,
                    },
                )
                .await;
                backoff_ms = INITIAL_BACKOFF_MS;
                // Reconnect immediately with fresh credentials.
            }
            ConnectionEnd::Lost { reason, was_open } => {
                emit(
                    &shared,
                    TransportEvent::Disconnected {
                        reason: Some(reason.clone()),
                        terminal: false,
                    },
                )
                .await;
                if was_open {
                    backoff_ms = INITIAL_BACKOFF_MS;
                }
                let jitter: u64 = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
                let sleep_ms = backoff_ms.saturating_add(jitter);
                warn!(reason, backoff_ms = sleep_ms, "socket connection lost, reconnecting");
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// One connection lifetime: dial, hello, then pump frames until the
/// connection ends.
async fn run_connection(
    shared: &Arc<SocketShared>,
    outbound_rx: &mut mpsc::Receiver<ClientFrame>,
    first: &mut Option<oneshot::Sender<Result<(), TransportError>>>,
) -> ConnectionEnd {
    shared.state_tx.send_replace(ConnectionState::Connecting);

    let (ws, _) = match tokio_tungstenite::connect_async(&shared.config.gateway_url).await {
        Ok(pair) => pair,
        Err(e) => {
            // A first-connect failure is a construction failure: report
            // it to the caller and let the orchestrator fall back.
            if let Some(tx) = first.take() {
                let _ = tx.send(Err(TransportError::Connection(e.to_string())));
                return ConnectionEnd::Shutdown;
            }
            return ConnectionEnd::Lost {
                reason: e.to_string(),
                was_open: false,
            };
        }
    };
    let (mut sink, mut stream) = ws.split();

    let creds = match &shared.store {
        Some(store) => match store.load_root() {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "unreadable root credentials, starting fresh session");
                None
            }
        },
        None => None,
    };

    if let Err(e) = send_frame(&mut sink, &ClientFrame::Hello { creds }).await {
        if let Some(tx) = first.take() {
            let _ = tx.send(Err(e));
            return ConnectionEnd::Shutdown;
        }
        return ConnectionEnd::Lost {
            reason: "hello frame rejected".to_owned(),
            was_open: false,
        };
    }

    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut was_open = false;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by gateway".to_owned());
                        return end_from_error(classify_disconnect(None, &reason), was_open);
                    }
                    Some(Ok(_)) => continue, // ping/pong/binary
                    Some(Err(e)) => {
                        return ConnectionEnd::Lost { reason: e.to_string(), was_open };
                    }
                    None => {
                        return ConnectionEnd::Lost {
                            reason: "stream ended".to_owned(),
                            was_open,
                        };
                    }
                };

                let frame = match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "unparseable gateway frame, ignoring");
                        continue;
                    }
                };

                if let Some(end) = handle_frame(shared, frame, first, &mut was_open).await {
                    return end;
                }
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    return ConnectionEnd::Shutdown;
                };
                if let Err(e) = send_frame(&mut sink, &frame).await {
                    return ConnectionEnd::Lost { reason: e.to_string(), was_open };
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return ConnectionEnd::Shutdown;
                }
            }
        }
    }
}

/// Process one gateway frame. Returns `Some` when the connection ends.
async fn handle_frame(
    shared: &Arc<SocketShared>,
    frame: ServerFrame,
    first: &mut Option<oneshot::Sender<Result<(), TransportError>>>,
    was_open: &mut bool,
) -> Option<ConnectionEnd> {
    match frame {
        ServerFrame::State { state, code, reason } => {
            shared.state_tx.send_replace(state);
            match state {
                ConnectionState::Open => {
                    *was_open = true;
                    info!("socket connection open");
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }
                    emit(shared, TransportEvent::Ready).await;
                }
                ConnectionState::Close => {
                    let reason = reason.unwrap_or_else(|| "closed".to_owned());
                    // A close before the connection ever opened is a
                    // construction failure: report it and stop so the
                    // orchestrator can fall back.
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Err(TransportError::Connection(reason)));
                        return Some(ConnectionEnd::Shutdown);
                    }
                    if code.as_deref() == Some(LOGGED_OUT_CODE) {
                        return Some(ConnectionEnd::LoggedOut { reason: Some(reason) });
                    }
                    let err = classify_disconnect(code.as_deref(), &reason);
                    return Some(end_from_error(err, *was_open));
                }
                ConnectionState::Connecting => {}
            }
        }
        ServerFrame::Creds { creds } => {
            if let Some(store) = &shared.store {
                if let Err(e) = store.persist_root(&creds) {
                    error!(error = %e, "failed to persist credential rotation");
                }
            }
        }
        ServerFrame::Keys { name, data } => {
            if let Some(store) = &shared.store {
                if let Err(e) = store.persist_ephemeral(&name, &data) {
                    warn!(error = %e, name, "failed to persist key artifact");
                }
            }
        }
        ServerFrame::Message {
            stanza,
            chat_id,
            message_id,
            body,
            push_name,
        } => {
            if !stanza.is_live() {
                debug!(?stanza, "discarding non-live message stanza");
                return None;
            }
            emit(
                shared,
                TransportEvent::Message(RawMessageEvent {
                    source: TransportKind::Socket,
                    chat_id,
                    message_id,
                    body,
                    push_name,
                    timestamp: Utc::now(),
                }),
            )
            .await;
        }
        ServerFrame::Ack { id, message_id } => {
            if let Some((_, tx)) = shared.pending.lock().await.remove(&id) {
                let _ = tx.send(Ok(SendReceipt {
                    message_id,
                    timestamp: Utc::now(),
                }));
            }
        }
        ServerFrame::PairCode { code } => {
            if let Some(tx) = shared.pending_pair.lock().await.take() {
                let _ = tx.send(Ok(code));
            } else {
                debug!("unsolicited pairing code frame ignored");
            }
        }
        ServerFrame::Error { id, code, message } => {
            if let Some(id) = id {
                if let Some((jid, tx)) = shared.pending.lock().await.remove(&id) {
                    let _ = tx.send(Err(TransportError::SendFailed {
                        jid,
                        reason: message,
                    }));
                }
                return None;
            }
            if let Some(tx) = shared.pending_pair.lock().await.take() {
                let _ = tx.send(Err(TransportError::Pairing(message)));
                return None;
            }
            let err = classify_disconnect(code.as_deref(), &message);
            if err.is_session_corruption() {
                return Some(end_from_error(err, *was_open));
            }
            warn!(code = code.as_deref().unwrap_or("-"), message, "gateway error frame");
        }
    }
    None
}

fn end_from_error(err: TransportError, was_open: bool) -> ConnectionEnd {
    match err {
        TransportError::SessionCorrupt { code, reason } => ConnectionEnd::Corrupt { code, reason },
        other => ConnectionEnd::Lost {
            reason: other.to_string(),
            was_open,
        },
    }
}

async fn send_frame<S>(sink: &mut S, frame: &ClientFrame) -> Result<(), TransportError>
where
    S: SinkExt<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(frame)?;
    sink.send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))
}

/// Fail every pending send and pairing waiter so callers are not left
/// waiting for answers that will never arrive.
async fn fail_pending(shared: &Arc<SocketShared>, reason: &str) {
    {
        let mut pending = shared.pending.lock().await;
        for (_, (jid, tx)) in pending.drain() {
            let _ = tx.send(Err(TransportError::SendFailed {
                jid,
                reason: reason.to_owned(),
            }));
        }
    }
    if let Some(tx) = shared.pending_pair.lock().await.take() {
        let _ = tx.send(Err(TransportError::Pairing(reason.to_owned())));
    }
}

async fn emit(shared: &Arc<SocketShared>, event: TransportEvent) {
    if shared.events.send(event).await.is_err() {
        debug!("event receiver dropped");
    }
}
