//! Configuration loading and management.
//!
//! Loads waygate configuration from `./waygate.toml` (or
//! `$WAYGATE_CONFIG_PATH`). Environment variables override file
//! values; file values override defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::Deserialize;

use crate::transport::TransportKind;

// ── Top-level config ────────────────────────────────────────────

/// Top-level waygate configuration loaded from TOML.
///
/// Path: `./waygate.toml` or `$WAYGATE_CONFIG_PATH`.
/// Env vars override file values; file values override defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WaygateConfig {
    /// Daemon-wide settings (`[daemon]`).
    pub daemon: DaemonConfig,
    /// Protocol-gateway endpoint settings (`[gateway]`).
    pub gateway: GatewayConfig,
    /// Automation-bridge endpoint settings (`[bridge]`).
    pub bridge: BridgeConfig,
    /// Session directory and cleanup settings (`[session]`).
    pub session: SessionConfig,
    /// Inbound dedup tuning (`[aggregator]`).
    pub aggregator: DedupConfig,
}

impl WaygateConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$WAYGATE_CONFIG_PATH` or `./waygate.toml`.
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be parsed, or
    /// when the resulting configuration fails validation.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: WaygateConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(WaygateConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("WAYGATE_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("waygate.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("WAYGATE_LOG_LEVEL") {
            self.daemon.log_level = v;
        }
        if let Some(v) = env("WAYGATE_GATEWAY_URL") {
            self.gateway.url = v;
        }
        if let Some(v) = env("WAYGATE_BRIDGE_URL") {
            self.bridge.url = v;
        }
        if let Some(v) = env("WAYGATE_BRIDGE_TOKEN") {
            self.bridge.auth_token = Some(v);
        }
        if let Some(v) = env("WAYGATE_SESSION_DIR") {
            self.session.dir = v;
        }
        if let Some(v) = env("WAYGATE_CLEANUP_CRON") {
            self.session.cleanup_cron = v;
        }
        if let Some(v) = env("WAYGATE_DELAY_MS") {
            match v.parse() {
                Ok(n) => self.aggregator.delay_ms = n,
                Err(_) => tracing::warn!(
                    var = "WAYGATE_DELAY_MS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Parse a TOML string into config (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error when the string is not valid config TOML.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: WaygateConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Validate endpoint URLs and schedule fields.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let gateway = url::Url::parse(&self.gateway.url)
            .with_context(|| format!("invalid gateway url {:?}", self.gateway.url))?;
        if !matches!(gateway.scheme(), "ws" | "wss") {
            anyhow::bail!(
                "gateway url must use ws:// or wss://, got {:?}",
                self.gateway.url
            );
        }

        let bridge = url::Url::parse(&self.bridge.url)
            .with_context(|| format!("invalid bridge url {:?}", self.bridge.url))?;
        if !matches!(bridge.scheme(), "http" | "https") {
            anyhow::bail!(
                "bridge url must use http:// or https://, got {:?}",
                self.bridge.url
            );
        }

        if self.daemon.roles.is_empty() {
            anyhow::bail!("at least one logical client role must be configured");
        }

        self.session
            .cleanup_cron
            .parse::<cron::Schedule>()
            .with_context(|| {
                format!("invalid cleanup cron {:?}", self.session.cleanup_cron)
            })?;

        self.aggregator.low_priority_kind().with_context(|| {
            format!(
                "invalid aggregator.low_priority {:?}",
                self.aggregator.low_priority
            )
        })?;

        Ok(())
    }

    /// Session directory for one logical client role.
    pub fn session_dir_for(&self, role: &str) -> PathBuf {
        PathBuf::from(&self.session.dir).join(role)
    }

    /// Bridge profile directory for one logical client role.
    pub fn profile_dir_for(&self, role: &str) -> String {
        format!("{}-{role}", self.bridge.profile_dir)
    }
}

// ── Daemon config ───────────────────────────────────────────────

/// Daemon-wide settings (`[daemon]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Tracing log level filter.
    pub log_level: String,
    /// Directory for rotated JSON log files.
    pub logs_dir: String,
    /// Graceful shutdown timeout in seconds.
    pub shutdown_timeout_seconds: u64,
    /// Logical client roles to construct on start.
    pub roles: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            logs_dir: default_subdir("logs"),
            shutdown_timeout_seconds: 10,
            roles: vec!["primary".to_string()],
        }
    }
}

// ── Gateway config ──────────────────────────────────────────────

/// Protocol-gateway endpoint settings (`[gateway]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway WebSocket URL.
    pub url: String,
    /// Seconds a send may wait for its ack frame.
    pub ack_deadline_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3002/ws".to_string(),
            ack_deadline_seconds: 60,
        }
    }
}

// ── Bridge config ───────────────────────────────────────────────

/// Automation-bridge endpoint settings (`[bridge]`).
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bridge base URL.
    pub url: String,
    /// Base name for per-role login-profile directories.
    pub profile_dir: String,
    /// Take over a competing login instead of being locked out.
    pub takeover: bool,
    /// Bound on the takeover attempt, in milliseconds.
    pub takeover_timeout_ms: u64,
    /// Bearer token for the bridge API, if it requires one.
    pub auth_token: Option<String>,
    /// Orchestrator-driven reconnect attempts before giving up.
    pub reconnect_attempts: u32,
    /// Sleep between reconnect attempts, in milliseconds.
    pub reconnect_backoff_ms: u64,
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("url", &self.url)
            .field("profile_dir", &self.profile_dir)
            .field("takeover", &self.takeover)
            .field("takeover_timeout_ms", &self.takeover_timeout_ms)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "__REDACTED__"),
            )
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("reconnect_backoff_ms", &self.reconnect_backoff_ms)
            .finish()
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3001".to_string(),
            profile_dir: default_subdir("web-profile"),
            takeover: true,
            takeover_timeout_ms: 45_000,
            auth_token: None,
            reconnect_attempts: 5,
            reconnect_backoff_ms: 2_000,
        }
    }
}

// ── Session config ──────────────────────────────────────────────

/// Session directory and scheduled-cleanup settings (`[session]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Root directory holding one session subdirectory per role.
    pub dir: String,
    /// Six-field cron expression for scheduled cleanup.
    pub cleanup_cron: String,
    /// Fixed UTC offset the schedule is anchored to, in seconds.
    pub cleanup_utc_offset_secs: i32,
    /// Minimum age in hours before an ephemeral file may be pruned.
    pub safe_age_hours: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dir: default_subdir("sessions"),
            // Twice per hour, away from the top-of-hour load spike.
            cleanup_cron: "0 10,40 * * * *".to_string(),
            // UTC-03:00.
            cleanup_utc_offset_secs: -10_800,
            safe_age_hours: 24,
        }
    }
}

impl SessionConfig {
    /// The fixed offset the cleanup schedule runs in. An out-of-range
    /// configured offset falls back to UTC.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.cleanup_utc_offset_secs)
            .unwrap_or_else(|| chrono::Offset::fix(&chrono::Utc))
    }

    /// Safe-age threshold as a duration.
    pub fn safe_age(&self) -> Duration {
        Duration::from_secs(self.safe_age_hours.saturating_mul(3_600))
    }
}

// ── Aggregator config ───────────────────────────────────────────

/// Inbound dedup tuning (`[aggregator]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Hold window applied to the low-priority source, in milliseconds.
    pub delay_ms: u64,
    /// Seen-key retention per generation, in seconds.
    pub seen_ttl_secs: u64,
    /// Which adapter is delayed: `"socket"` or `"web"`.
    pub low_priority: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            delay_ms: 200,
            seen_ttl_secs: 300,
            low_priority: "web".to_string(),
        }
    }
}

impl DedupConfig {
    /// Hold window as a duration.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Seen-key retention as a duration.
    pub fn seen_ttl(&self) -> Duration {
        Duration::from_secs(self.seen_ttl_secs)
    }

    /// Parse the configured low-priority source.
    ///
    /// # Errors
    ///
    /// Returns an error for anything other than `socket` or `web`.
    pub fn low_priority_kind(&self) -> Result<TransportKind> {
        match self.low_priority.as_str() {
            "socket" => Ok(TransportKind::Socket),
            "web" => Ok(TransportKind::Web),
            other => Err(anyhow::anyhow!("unknown transport kind {other:?}")),
        }
    }
}

/// Default data subdirectory, under the platform data dir when
/// resolvable, otherwise relative to the working directory.
fn default_subdir(name: &str) -> String {
    directories::ProjectDirs::from("com", "waygate", "waygate")
        .map(|dirs| dirs.data_dir().join(name).to_string_lossy().into_owned())
        .unwrap_or_else(|| format!(".waygate/{name}"))
}

// ── Tests ───────────────────────────────────────────────────────
