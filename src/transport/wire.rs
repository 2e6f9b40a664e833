//! Frame codec for the protocol-gateway WebSocket.
//!
//! The gateway terminates the network's end-to-end crypto and exposes a
//! framed JSON surface: the adapter sends [`ClientFrame`]s and receives
//! [`ServerFrame`]s. Frames carry a `type` tag; send/ack correlation
//! uses a client-assigned numeric id.

use serde::{Deserialize, Serialize};

use super::ConnectionState;

// ---------------------------------------------------------------------------
// Client → gateway
// ---------------------------------------------------------------------------

/// Frames the adapter sends to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on every connection. `creds` is the persisted root
    /// credential blob, or absent to start a fresh session for pairing.
    Hello {
        /// Root credential blob from the session store.
        #[serde(skip_serializing_if = "Option::is_none")]
        creds: Option<serde_json::Value>,
    },
    /// Outbound message. The gateway answers with an `ack` or `error`
    /// frame carrying the same `id`.
    Send {
        /// Client-assigned correlation id.
        id: u64,
        /// Target JID.
        jid: String,
        /// Message payload.
        content: WireContent,
    },
    /// Request a numeric device-pairing code for `number`.
    Pair {
        /// Phone number in canonical digit form.
        number: String,
    },
}

/// Outbound payload inside a `send` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireContent {
    /// Plain text message.
    Text {
        /// Message text.
        text: String,
    },
    /// Document attachment, bytes base64-encoded.
    Document {
        /// Base64-encoded file bytes.
        data_b64: String,
        /// MIME type.
        mime_type: String,
        /// File name shown to the recipient.
        file_name: String,
        /// Optional caption.
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Gateway → client
// ---------------------------------------------------------------------------

/// Frames the gateway sends to the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Connection-state transition.
    State {
        /// New state.
        state: ConnectionState,
        /// Structured close/error code, when the transition is a close.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        /// Human-readable detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Root credential rotation. Must be persisted before the next
    /// reconnect or the session is lost.
    Creds {
        /// Replacement root credential blob.
        creds: serde_json::Value,
    },
    /// Ephemeral key artifact (ratchet/pre-key/sender-key) to persist.
    Keys {
        /// Artifact file name, carries the ephemeral marker.
        name: String,
        /// Artifact content.
        data: serde_json::Value,
    },
    /// An inbound message stanza.
    Message {
        /// Stanza classification; only `notify` is a live notification.
        stanza: StanzaClass,
        /// Conversation JID.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
        /// Network-assigned message id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        /// Text content.
        body: String,
        /// Sender display name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        push_name: Option<String>,
    },
    /// Acknowledgment for a `send` frame.
    Ack {
        /// Correlation id from the `send` frame.
        id: u64,
        /// Network-assigned id of the delivered message.
        message_id: String,
    },
    /// Numeric pairing code, answer to a `pair` frame.
    PairCode {
        /// The code to enter on the physical device.
        code: String,
    },
    /// Gateway-reported error. With an `id`, it rejects that send;
    /// without one, it reports a connection-level problem.
    Error {
        /// Correlation id of the rejected send, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Structured error code.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        /// Human-readable detail.
        message: String,
    },
}

/// How a message stanza was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StanzaClass {
    /// Live notification — the only class forwarded to business logic.
    Notify,
    /// History replay during sync. Discarded.
    Append,
    /// Anything else (system stanzas, future classes). Discarded.
    #[serde(other)]
    Other,
}

impl StanzaClass {
    /// Whether this stanza is a live notification worth forwarding.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Notify)
    }
}
