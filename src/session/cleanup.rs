//! Scheduled pruning of ephemeral session artifacts.
//!
//! Runs as a background Tokio task. A cron expression (default twice
//! per hour at fixed offsets) is evaluated in a fixed UTC offset; when
//! due, the task first queries the live socket adapter's connection
//! state and skips entirely if the connection is open — cleanup must
//! never run against a live connection's cryptographic state. The gap
//! between that check and the filesystem work is an accepted race, not
//! a guarantee.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, FixedOffset, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use super::SessionStore;
use crate::transport::{ConnectionState, Transport};

/// How often the loop wakes to evaluate the cron expression.
const TICK_INTERVAL_SECS: u64 = 30;

/// Late-bound handle to the socket adapter. The daemon fills it in
/// once the socket factory has connected; while it is empty no live
/// socket connection can own the session files.
pub type SocketHandle = Arc<std::sync::Mutex<Option<Arc<dyn Transport>>>>;

/// Cleanup schedule and safety thresholds.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Six-field cron expression evaluated in `utc_offset`.
    pub cron: String,
    /// Fixed timezone the schedule is anchored to.
    pub utc_offset: FixedOffset,
    /// Minimum file age before an ephemeral artifact is eligible.
    pub safe_age: Duration,
}

/// What one scheduled run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The socket connection was open; nothing was touched.
    SkippedLiveConnection,
    /// Stale ephemeral files were deleted.
    Pruned {
        /// Number of files removed.
        deleted: usize,
    },
}

/// Execute one cleanup run against `store`, given the socket adapter's
/// connection state observed just before the call.
///
/// # Errors
///
/// Returns an error if the deletion walk fails.
pub fn run_cleanup(
    store: &SessionStore,
    socket_state: ConnectionState,
    safe_age: Duration,
) -> anyhow::Result<CleanupOutcome> {
    if socket_state == ConnectionState::Open {
        info!("session cleanup skipped: socket connection is open");
        return Ok(CleanupOutcome::SkippedLiveConnection);
    }

    let cutoff = SystemTime::now()
        .checked_sub(safe_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let deleted = store.delete_stale_ephemeral(cutoff)?;
    info!(deleted, "session cleanup pruned stale ephemeral artifacts");
    Ok(CleanupOutcome::Pruned { deleted })
}

/// Connection state observed through the late-bound socket handle. An
/// empty handle reads as closed.
pub async fn observed_socket_state(socket: &SocketHandle) -> ConnectionState {
    let transport = socket.lock().ok().and_then(|guard| guard.clone());
    match transport {
        Some(transport) => transport.state().await,
        None => ConnectionState::Close,
    }
}

/// Whether the schedule has a trigger between `last_run` and `now`,
/// both interpreted in the schedule's fixed offset.
pub fn is_due(
    schedule: &cron::Schedule,
    last_run: DateTime<FixedOffset>,
    now: DateTime<FixedOffset>,
) -> bool {
    schedule.after(&last_run).take(1).any(|next| next <= now)
}

/// Run the cleanup background loop until shutdown.
///
/// Exits when the shutdown signal is received or the watch channel
/// closes. An invalid cron expression is reported once and disables
/// the loop rather than panicking the daemon.
pub async fn run_cleanup_loop(
    store: SessionStore,
    socket: SocketHandle,
    config: CleanupConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let schedule = match cron::Schedule::from_str(&config.cron) {
        Ok(s) => s,
        Err(e) => {
            warn!(cron = %config.cron, error = %e, "invalid cleanup cron expression, cleanup disabled");
            return;
        }
    };

    info!(cron = %config.cron, offset = %config.utc_offset, "session cleanup scheduler started");

    let mut interval = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SECS));
    let mut last_run = Utc::now().with_timezone(&config.utc_offset);

    // Skip the first immediate tick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Utc::now().with_timezone(&config.utc_offset);
                if !is_due(&schedule, last_run, now) {
                    continue;
                }
                last_run = now;

                let state = observed_socket_state(&socket).await;
                if let Err(e) = run_cleanup(&store, state, config.safe_age) {
                    warn!(error = %e, "session cleanup failed");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("session cleanup scheduler shutting down");
                    break;
                }
            }
        }
    }
}
