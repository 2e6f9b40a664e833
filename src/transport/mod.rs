//! The capability contract shared by both WhatsApp transports.
//!
//! Two structurally different clients of the same network — a socket
//! client of the protocol gateway ([`socket::SocketTransport`]) and an
//! HTTP client of the browser-automation bridge ([`web::WebTransport`])
//! — implement one [`Transport`] trait so the orchestrator can swap one
//! for the other without business code noticing. Adapter-specific
//! payload shapes never cross this boundary: everything inbound is
//! normalized to [`TransportEvent`] before leaving the adapter.

pub mod socket;
pub mod web;
pub mod wire;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Kinds and states
// ---------------------------------------------------------------------------

/// Which concrete implementation backs a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Native multi-device wire protocol via the gateway WebSocket.
    Socket,
    /// Hosted web client driven through the automation bridge.
    Web,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket => write!(f, "socket"),
            Self::Web => write!(f, "web"),
        }
    }
}

/// Connection state reported by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Connected and usable.
    Open,
    /// Not connected.
    Close,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Close => write!(f, "close"),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalized events
// ---------------------------------------------------------------------------

/// A live inbound message, normalized from whichever shape the backing
/// client uses. Identity for deduplication is `chat_id:message_id`.
#[derive(Debug, Clone)]
pub struct RawMessageEvent {
    /// Which adapter observed the message.
    pub source: TransportKind,
    /// Conversation identifier (JID), if the client exposed one.
    pub chat_id: Option<String>,
    /// Network-assigned message identifier, if the client exposed one.
    pub message_id: Option<String>,
    /// Message text content.
    pub body: String,
    /// Sender display name, if known.
    pub push_name: Option<String>,
    /// When the message was observed.
    pub timestamp: DateTime<Utc>,
}

/// What the business handler sees. One shape, regardless of adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Sender identity (JID when available, display name otherwise).
    pub from: String,
    /// Message text content.
    pub body: String,
}

/// Events an adapter pushes to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection transitioned to open.
    Ready,
    /// The connection transitioned to closed.
    Disconnected {
        /// Human-readable trigger, if the transport provided one.
        reason: Option<String>,
        /// The adapter has given up for good (e.g. the device was
        /// unlinked) and no reconnect will follow.
        terminal: bool,
    },
    /// A live inbound message.
    Message(RawMessageEvent),
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Outbound message payload.
#[derive(Debug, Clone)]
pub enum OutboundContent {
    /// Plain text.
    Text(String),
    /// A document attachment.
    Document {
        /// Raw file bytes.
        bytes: Vec<u8>,
        /// MIME type, e.g. `application/pdf`.
        mime_type: String,
        /// File name shown to the recipient.
        file_name: String,
    },
}

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Caption attached to a document send.
    pub caption: Option<String>,
}

/// Acknowledgment for a delivered send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Network-assigned identifier of the sent message.
    pub message_id: String,
    /// When the transport acknowledged the send.
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Close/error codes the gateway reports for cryptographic session
/// state mismatches. Structured classification is preferred over
/// message-substring inspection.
const CORRUPTION_CODES: &[&str] = &["bad_mac", "session_record_missing", "sender_key_missing"];

/// Free-text markers used only when the transport gave us no structured
/// code. The fallback path logs when it fires.
const CORRUPTION_MARKERS: &[&str] = &["bad mac", "no matching sessions", "senderkeyrecord"];

/// Errors from either transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The adapter failed to initialize. Triggers orchestrator fallback.
    #[error("adapter construction failed: {0}")]
    Construction(String),

    /// Transient connection loss.
    #[error("connection error: {0}")]
    Connection(String),

    /// Cryptographic session state mismatch. Triggers session wipe and
    /// resocket inside the socket adapter.
    #[error("session corrupt ({code:?}): {reason}")]
    SessionCorrupt {
        /// Structured code from the transport, when available.
        code: Option<String>,
        /// Human-readable detail.
        reason: String,
    },

    /// A send was rejected or the target is unreachable.
    #[error("send to {jid} failed: {reason}")]
    SendFailed {
        /// Target JID.
        jid: String,
        /// Failure detail.
        reason: String,
    },

    /// Operation requires an open connection.
    #[error("not connected")]
    NotConnected,

    /// Pairing-code request failed.
    #[error("pairing failed: {0}")]
    Pairing(String),

    /// HTTP request to the bridge failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error from the gateway connection.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Wire frame (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error while handling session state.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this error is diagnostic of corrupted session state, as
    /// opposed to a network failure.
    pub fn is_session_corruption(&self) -> bool {
        matches!(self, Self::SessionCorrupt { .. })
    }
}

/// Classify a close/error report from the gateway.
///
/// Prefers the structured `code`; falls back to substring inspection of
/// the free-text reason and logs when that fragile path is what fired.
pub fn classify_disconnect(code: Option<&str>, reason: &str) -> TransportError {
    if let Some(code) = code {
        if CORRUPTION_CODES.contains(&code) {
            return TransportError::SessionCorrupt {
                code: Some(code.to_owned()),
                reason: reason.to_owned(),
            };
        }
        return TransportError::Connection(format!("{code}: {reason}"));
    }

    let lowered = reason.to_lowercase();
    if CORRUPTION_MARKERS.iter().any(|m| lowered.contains(m)) {
        tracing::warn!(
            reason,
            "classified session corruption from message text; no structured code available"
        );
        return TransportError::SessionCorrupt {
            code: None,
            reason: reason.to_owned(),
        };
    }

    TransportError::Connection(reason.to_owned())
}

// ---------------------------------------------------------------------------
// The contract
// ---------------------------------------------------------------------------

/// Capability contract implemented identically by both adapters.
///
/// Inbound events flow through the `mpsc::Sender<TransportEvent>` the
/// adapter was constructed with; the trait covers the outbound and
/// lifecycle surface.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> TransportKind;

    /// Establish the underlying connection. Resolves or errs on the
    /// first connection outcome.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Tear down the connection and release native resources.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Send a message to `jid`. Suspends until the transport
    /// acknowledges or rejects.
    async fn send_message(
        &self,
        jid: &str,
        content: OutboundContent,
        options: SendOptions,
    ) -> Result<SendReceipt, TransportError>;

    /// Point-in-time readiness probe. Queries live state, never a
    /// cached flag.
    async fn is_ready(&self) -> bool;

    /// Current connection state.
    async fn state(&self) -> ConnectionState;
}
