//! Browser-automation adapter: HTTP client of the headless bridge.
//!
//! Drives a hosted web client through an automation bridge, mirroring
//! the socket adapter's contract over a very different substrate:
//! session start with conflict takeover, long-polling for events, and
//! a live `GET /state` probe for readiness. The bridge persists its
//! own login-profile artifacts under `profile_dir`, independent of the
//! socket adapter's session store.
//!
//! Initial pairing is a scannable code: the bridge's `qr` event carries
//! a rendered block which is written to the operator console.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{
    ConnectionState, OutboundContent, RawMessageEvent, SendOptions, SendReceipt, Transport,
    TransportError, TransportEvent, TransportKind,
};

/// The automation client's literal for a usable session. Readiness is
/// compared against this on every probe, never cached.
const CONNECTED_LITERAL: &str = "CONNECTED";

/// HTTP connect timeout.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// HTTP request timeout for normal operations.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Long-poll timeout for the events client.
const POLL_TIMEOUT_SECS: u64 = 60;

/// Maximum reconnect backoff for the poll loop, in milliseconds.
const MAX_POLL_BACKOFF_MS: u64 = 30_000;

/// Web adapter configuration.
#[derive(Clone)]
pub struct WebConfig {
    /// Bridge base URL, e.g. `http://127.0.0.1:3001`.
    pub bridge_url: String,
    /// Where the bridge keeps its login-profile artifacts.
    pub profile_dir: String,
    /// Take over a competing login instead of being locked out.
    pub takeover: bool,
    /// Bound on the takeover attempt, in milliseconds.
    pub takeover_timeout_ms: u64,
    /// Bearer token for the bridge API, if it requires one.
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for WebConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebConfig")
            .field("bridge_url", &self.bridge_url)
            .field("profile_dir", &self.profile_dir)
            .field("takeover", &self.takeover)
            .field("takeover_timeout_ms", &self.takeover_timeout_ms)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "__REDACTED__"))
            .finish()
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bridge_url: "http://127.0.0.1:3001".to_owned(),
            profile_dir: ".waygate-web-profile".to_owned(),
            takeover: true,
            takeover_timeout_ms: 45_000,
            auth_token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge API types
// ---------------------------------------------------------------------------

/// Response envelope from the bridge HTTP API.
#[derive(Debug, Deserialize)]
struct BridgeResponse<T> {
    #[allow(dead_code)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BridgeState {
    state: String,
}

#[derive(Debug, Deserialize)]
struct BridgeSendResult {
    message_id: String,
}

#[derive(Debug, Serialize)]
struct SessionStartRequest<'a> {
    takeover: bool,
    takeover_timeout_ms: u64,
    profile_dir: &'a str,
}

/// Events from the bridge's long-poll endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeEvent {
    /// Pairing code to render for the operator.
    Qr { qr: String },
    /// Login accepted.
    Authenticated,
    /// Automation client state changed.
    StateChange { state: String },
    /// Login rejected; re-pairing needed.
    AuthFailure { message: String },
    /// Session dropped.
    Disconnected { reason: Option<String> },
    /// Inbound or own message.
    Message {
        chat_id: Option<String>,
        message_id: Option<String>,
        body: String,
        from_me: bool,
        push_name: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// The browser-automation adapter.
pub struct WebTransport {
    config: WebConfig,
    client: reqwest::Client,
    events: mpsc::Sender<TransportEvent>,
    /// Stop signal for the current long-poll listener. Replaced on
    /// every `connect()` so a reconnect never leaves the previous
    /// listener polling alongside the new one.
    listener_stop: Mutex<Option<watch::Sender<bool>>>,
}

impl WebTransport {
    /// Create an adapter for the bridge at `config.bridge_url`.
    /// Nothing happens until [`Transport::connect`] is called.
    pub fn new(config: WebConfig, events: mpsc::Sender<TransportEvent>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            config,
            client,
            events,
            listener_stop: Mutex::new(None),
        }
    }

    /// Open a new listener epoch: signal the previous long-poll task
    /// to stop and hand out the stop receiver for its replacement.
    fn begin_listener_epoch(&self) -> watch::Receiver<bool> {
        let (stop_tx, stop_rx) = watch::channel(false);
        if let Ok(mut guard) = self.listener_stop.lock() {
            if let Some(previous) = guard.replace(stop_tx) {
                let _ = previous.send(true);
            }
        }
        stop_rx
    }

    /// Stop the current long-poll listener, if any.
    fn stop_listener(&self) {
        if let Ok(mut guard) = self.listener_stop.lock() {
            if let Some(stop) = guard.take() {
                let _ = stop.send(true);
            }
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.config.bridge_url);
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.config.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Fetch the automation client's own state literal.
    async fn fetch_state(&self) -> Result<String, TransportError> {
        let resp = self.request(reqwest::Method::GET, "/state").send().await?;
        if !resp.status().is_success() {
            return Err(TransportError::Connection(format!(
                "bridge state probe returned {}",
                resp.status()
            )));
        }
        let body: BridgeResponse<BridgeState> = resp.json().await?;
        body.data
            .map(|s| s.state)
            .ok_or_else(|| TransportError::Connection("bridge returned no state".to_owned()))
    }
}

#[async_trait]
impl Transport for WebTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Web
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let request = SessionStartRequest {
            takeover: self.config.takeover,
            takeover_timeout_ms: self.config.takeover_timeout_ms,
            profile_dir: &self.config.profile_dir,
        };
        let resp = self
            .request(reqwest::Method::POST, "/session/start")
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::Construction(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Construction(format!(
                "bridge session start returned {status}: {body}"
            )));
        }

        info!(profile_dir = %self.config.profile_dir, "web automation session started");
        spawn_event_listener(
            self.config.clone(),
            self.events.clone(),
            self.begin_listener_epoch(),
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.stop_listener();
        // Best effort: the bridge cleans up abandoned sessions itself.
        let _ = self
            .request(reqwest::Method::POST, "/session/stop")
            .send()
            .await;
        Ok(())
    }

    async fn send_message(
        &self,
        jid: &str,
        content: OutboundContent,
        options: SendOptions,
    ) -> Result<SendReceipt, TransportError> {
        let body = match content {
            OutboundContent::Text(text) => serde_json::json!({ "jid": jid, "text": text }),
            OutboundContent::Document {
                bytes,
                mime_type,
                file_name,
            } => serde_json::json!({
                "jid": jid,
                "document": {
                    "data_b64": base64::engine::general_purpose::STANDARD.encode(bytes),
                    "mime_type": mime_type,
                    "file_name": file_name,
                },
                "caption": options.caption,
            }),
        };

        let resp = self
            .request(reqwest::Method::POST, "/send")
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(TransportError::SendFailed {
                jid: jid.to_owned(),
                reason: format!("bridge returned {status}: {body_text}"),
            });
        }

        let envelope: BridgeResponse<BridgeSendResult> = resp.json().await?;
        let result = envelope.data.ok_or_else(|| TransportError::SendFailed {
            jid: jid.to_owned(),
            reason: envelope
                .error
                .unwrap_or_else(|| "bridge returned no send result".to_owned()),
        })?;

        debug!(jid, message_id = %result.message_id, "message sent via web bridge");
        Ok(SendReceipt {
            message_id: result.message_id,
            timestamp: Utc::now(),
        })
    }

    /// Poll the automation client's own state accessor. The underlying
    /// session can silently drop, so a cached flag would lie.
    async fn is_ready(&self) -> bool {
        self.fetch_state()
            .await
            .is_ok_and(|s| s == CONNECTED_LITERAL)
    }

    async fn state(&self) -> ConnectionState {
        match self.fetch_state().await.as_deref() {
            Ok(CONNECTED_LITERAL) => ConnectionState::Open,
            Ok("OPENING" | "PAIRING" | "TIMEOUT") => ConnectionState::Connecting,
            _ => ConnectionState::Close,
        }
    }
}

// ---------------------------------------------------------------------------
// Event listener
// ---------------------------------------------------------------------------

/// Spawn the long-poll listener that translates bridge events into the
/// normalized transport shapes. Retries with exponential backoff until
/// its epoch is stopped.
fn spawn_event_listener(
    config: WebConfig,
    events: mpsc::Sender<TransportEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let poll_url = format!("{}/events/poll", config.bridge_url);
        let mut backoff_ms: u64 = 1_000;

        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to build poll client, using default");
                reqwest::Client::default()
            }
        };

        loop {
            let polled = tokio::select! {
                result = poll_once(&client, &poll_url, &config, &events) => result,
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        debug!("web event listener shutting down");
                        return;
                    }
                    continue;
                }
            };

            match polled {
                Ok(true) => {
                    backoff_ms = 1_000;
                }
                Ok(false) => {
                    // Receiver dropped: nobody is listening any more.
                    return;
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms, "web event poll failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(MAX_POLL_BACKOFF_MS);
                }
            }
        }
    });
}

/// One long-poll round trip. Returns `Ok(false)` when the event
/// receiver has been dropped.
async fn poll_once(
    client: &reqwest::Client,
    poll_url: &str,
    config: &WebConfig,
    events: &mpsc::Sender<TransportEvent>,
) -> Result<bool, TransportError> {
    let mut request = client.get(poll_url);
    if let Some(token) = &config.auth_token {
        request = request.bearer_auth(token);
    }

    let resp = match request.send().await {
        Ok(resp) => resp,
        // Normal: long-poll timeout expired, retry immediately.
        Err(e) if e.is_timeout() => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    if !resp.status().is_success() {
        return Err(TransportError::Connection(format!(
            "event poll returned {}",
            resp.status()
        )));
    }

    let batch: Vec<BridgeEvent> = resp.json().await?;
    for event in batch {
        if let Some(normalized) = translate(event) {
            if events.send(normalized).await.is_err() {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Map a bridge event to the normalized shape, or drop it.
fn translate(event: BridgeEvent) -> Option<TransportEvent> {
    match event {
        BridgeEvent::Qr { qr } => {
            // Operator console, not the log file: the block must render
            // as a scannable code.
            println!("Scan this code with the WhatsApp app to pair the web session:\n{qr}");
            None
        }
        BridgeEvent::Authenticated => {
            info!("web session authenticated");
            None
        }
        BridgeEvent::StateChange { state } => {
            debug!(state, "web session state change");
            if state == CONNECTED_LITERAL {
                Some(TransportEvent::Ready)
            } else {
                None
            }
        }
        BridgeEvent::AuthFailure { message } => {
            warn!(message, "web session authentication failed");
            // The bridge can re-pair through a fresh scannable code on
            // the next session start, so this is recoverable.
            Some(TransportEvent::Disconnected {
                reason: Some(format!("auth failure: {message}")),
                terminal: false,
            })
        }
        BridgeEvent::Disconnected { reason } => Some(TransportEvent::Disconnected {
            reason,
            terminal: false,
        }),
        BridgeEvent::Message {
            chat_id,
            message_id,
            body,
            from_me,
            push_name,
        } => {
            if from_me {
                return None;
            }
            Some(TransportEvent::Message(RawMessageEvent {
                source: TransportKind::Web,
                chat_id,
                message_id,
                body,
                push_name,
                timestamp: Utc::now(),
            }))
        }
    }
}
