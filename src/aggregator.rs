//! Inbound event funnel: cross-adapter deduplication and delivery.
//!
//! Both adapters observe the same network, so an inbound message can
//! arrive twice. Every raw event funnels through
//! [`EventAggregator::handle_incoming`], which keys events by
//! `chat_id:message_id`, drops duplicates, and holds low-priority
//! arrivals for a short window so the high-priority duplicate can win.
//! The business handler is invoked at most once per key, and a handler
//! error never interrupts subsequent event processing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error};
use uuid::Uuid;

use crate::transport::{InboundMessage, RawMessageEvent, TransportKind};

/// The one registered business callback. Errors are caught and logged
/// by the aggregator, never propagated.
pub type MessageHandler =
    Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Default hold window for low-priority arrivals.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(200);

/// Default retention for seen keys.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// SeenSet
// ---------------------------------------------------------------------------

/// Bounded set of identity keys already delivered to the handler.
///
/// Two generations rotated on a TTL: a key is retained for at least one
/// full TTL and at most two, which is sized to the maximum plausible
/// cross-adapter delay rather than growing for the process lifetime.
#[derive(Debug)]
pub struct SeenSet {
    current: HashSet<String>,
    previous: HashSet<String>,
    rotated_at: Instant,
    ttl: Duration,
}

impl SeenSet {
    /// Create a seen-set retaining keys for between `ttl` and `2*ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            current: HashSet::new(),
            previous: HashSet::new(),
            rotated_at: Instant::now(),
            ttl,
        }
    }

    fn rotate_if_due(&mut self) {
        let elapsed = self.rotated_at.elapsed();
        if elapsed >= self.ttl.saturating_mul(2) {
            // Idle long enough that both generations are expired.
            self.current.clear();
            self.previous.clear();
            self.rotated_at = Instant::now();
        } else if elapsed >= self.ttl {
            self.previous = std::mem::take(&mut self.current);
            self.rotated_at = Instant::now();
        }
    }

    /// Whether `key` is still retained.
    pub fn contains(&mut self, key: &str) -> bool {
        self.rotate_if_due();
        self.current.contains(key) || self.previous.contains(key)
    }

    /// Mark `key` seen. Returns `false` if it was already retained.
    pub fn insert(&mut self, key: &str) -> bool {
        self.rotate_if_due();
        if self.previous.contains(key) {
            return false;
        }
        self.current.insert(key.to_owned())
    }

    /// Number of retained keys across both generations.
    pub fn len(&self) -> usize {
        self.current.len().saturating_add(self.previous.len())
    }

    /// Whether no keys are retained.
    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.previous.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Aggregator tuning.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Hold window applied to the low-priority source.
    pub delay: Duration,
    /// Seen-key retention per generation.
    pub seen_ttl: Duration,
    /// Which adapter's arrivals are delayed. The other is delivered
    /// immediately.
    pub low_priority: TransportKind,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_DELAY,
            seen_ttl: DEFAULT_SEEN_TTL,
            low_priority: TransportKind::Web,
        }
    }
}

/// Single inbound funnel shared by all adapters of one logical client.
pub struct EventAggregator {
    seen: Arc<Mutex<SeenSet>>,
    config: AggregatorConfig,
}

impl EventAggregator {
    /// Create an aggregator with the given tuning.
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            seen: Arc::new(Mutex::new(SeenSet::new(config.seen_ttl))),
            config,
        }
    }

    /// Derive the dedup identity key, when both components are present.
    pub fn identity_key(event: &RawMessageEvent) -> Option<String> {
        match (&event.chat_id, &event.message_id) {
            (Some(chat), Some(msg)) => Some(format!("{chat}:{msg}")),
            _ => None,
        }
    }

    /// Funnel one raw event toward `handler`.
    ///
    /// Undeduplicatable events (missing either id) are delivered
    /// immediately. `allow_replay` marks the key and delivers
    /// unconditionally, for deliberate re-delivery. Otherwise seen keys
    /// are dropped; low-priority arrivals are held for the delay window
    /// and re-checked before delivery; high-priority arrivals are
    /// marked and delivered immediately.
    pub async fn handle_incoming(
        &self,
        event: RawMessageEvent,
        handler: MessageHandler,
        allow_replay: bool,
    ) {
        let Some(key) = Self::identity_key(&event) else {
            debug!(source = %event.source, "event missing chat or message id, delivering without dedup");
            deliver(event, &handler).await;
            return;
        };

        if allow_replay {
            self.seen.lock().await.insert(&key);
            deliver(event, &handler).await;
            return;
        }

        {
            let mut seen = self.seen.lock().await;
            if seen.contains(&key) {
                debug!(key = %key, source = %event.source, "duplicate event dropped");
                return;
            }
            if event.source != self.config.low_priority {
                seen.insert(&key);
                drop(seen);
                deliver(event, &handler).await;
                return;
            }
        }

        // Low-priority source: hold for the delay window, then deliver
        // only if no high-priority duplicate claimed the key meanwhile.
        let seen = Arc::clone(&self.seen);
        let delay = self.config.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut guard = seen.lock().await;
                if guard.contains(&key) {
                    debug!(key = %key, source = %event.source, "delayed event superseded by high-priority duplicate");
                    return;
                }
                guard.insert(&key);
            }
            deliver(event, &handler).await;
        });
    }

    /// Number of retained seen keys, for diagnostics.
    pub async fn seen_len(&self) -> usize {
        self.seen.lock().await.len()
    }
}

/// Invoke the business handler, containing any error it throws.
async fn deliver(event: RawMessageEvent, handler: &MessageHandler) {
    let correlation_id = Uuid::new_v4();
    let source = event.source;
    let chat_id = event.chat_id.clone();
    let message_id = event.message_id.clone();

    let from = event
        .chat_id
        .or(event.push_name)
        .unwrap_or_else(|| "unknown".to_owned());
    let message = InboundMessage {
        from,
        body: event.body,
    };

    if let Err(e) = handler(message).await {
        error!(
            %correlation_id,
            %source,
            chat_id = chat_id.as_deref().unwrap_or("-"),
            message_id = message_id.as_deref().unwrap_or("-"),
            error = %e,
            "business handler failed"
        );
    }
}
