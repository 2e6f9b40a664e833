#![allow(missing_docs)]

//! Waygate daemon and administrative CLI.
//!
//! `waygate start` runs the transport core: per-role logical clients
//! with socket-first adapter failover, cross-adapter inbound dedup,
//! and the scheduled session-cleanup loop. The other subcommands are
//! one-shot administrative flows.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use waygate::aggregator::{AggregatorConfig, EventAggregator, MessageHandler};
use waygate::config::WaygateConfig;
use waygate::logging;
use waygate::orchestrator::{
    build_logical_client, ReconnectPolicy, TransportFactories, TransportFactory,
};
use waygate::session::cleanup::{run_cleanup_loop, CleanupConfig, SocketHandle};
use waygate::session::SessionStore;
use waygate::transport::socket::{SocketConfig, SocketTransport};
use waygate::transport::web::{WebConfig, WebTransport};
use waygate::transport::{InboundMessage, Transport};

#[derive(Parser)]
#[command(name = "waygate", version, about = "WhatsApp transport daemon with interchangeable adapters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the transport daemon.
    Start,
    /// Request a device-pairing code for a phone number.
    Pair {
        /// Logical client the pairing is performed for.
        #[arg(long, default_value = "primary")]
        role: String,
        /// Phone number to link, digits in any common formatting.
        #[arg(long)]
        number: String,
    },
    /// Session-directory administration.
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Delete session artifacts tied to one phone number.
    Reset {
        /// Logical client whose session directory is targeted.
        #[arg(long, default_value = "primary")]
        role: String,
        /// Phone number whose artifacts are deleted.
        #[arg(long)]
        number: String,
    },
    /// Delete all ephemeral key artifacts, keeping root credentials.
    Prune {
        /// Logical client whose session directory is targeted.
        #[arg(long, default_value = "primary")]
        role: String,
    },
    /// Delete the entire session directory.
    Clear {
        /// Logical client whose session directory is targeted.
        #[arg(long, default_value = "primary")]
        role: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Start => start().await,
        Command::Pair { role, number } => pair(&role, &number).await,
        Command::Session { command } => session_admin(command),
    }
}

/// Run the daemon until a shutdown signal arrives.
async fn start() -> Result<()> {
    let config = WaygateConfig::load().context("failed to load configuration")?;
    let _guard = logging::init_production(
        Path::new(&config.daemon.logs_dir),
        &config.daemon.log_level,
    )?;

    info!(version = env!("CARGO_PKG_VERSION"), "waygate starting");

    let aggregator_config = AggregatorConfig {
        delay: config.aggregator.delay(),
        seen_ttl: config.aggregator.seen_ttl(),
        low_priority: config.aggregator.low_priority_kind()?,
    };
    let reconnect = ReconnectPolicy {
        attempts: config.bridge.reconnect_attempts,
        backoff: Duration::from_millis(config.bridge.reconnect_backoff_ms),
    };

    let (shutdown_tx, _) = watch::channel(false);
    let mut clients = Vec::new();

    for role in &config.daemon.roles {
        let aggregator = Arc::new(EventAggregator::new(aggregator_config.clone()));
        let store = SessionStore::new(config.session_dir_for(role));

        let socket_config = SocketConfig {
            gateway_url: config.gateway.url.clone(),
            ack_deadline: Duration::from_secs(config.gateway.ack_deadline_seconds),
        };
        let web_config = WebConfig {
            bridge_url: config.bridge.url.clone(),
            profile_dir: config.profile_dir_for(role),
            takeover: config.bridge.takeover,
            takeover_timeout_ms: config.bridge.takeover_timeout_ms,
            auth_token: config.bridge.auth_token.clone(),
        };

        // The factory stashes the socket adapter here so the cleanup
        // loop can query its live connection state.
        let socket_slot: SocketHandle = Arc::new(Mutex::new(None));

        let factories = TransportFactories {
            socket: socket_factory(socket_config, store.clone(), Arc::clone(&socket_slot)),
            web: web_factory(web_config),
        };

        let client = build_logical_client(role, &factories, aggregator, reconnect.clone())
            .await
            .with_context(|| format!("failed to construct logical client {role:?}"))?;

        client.set_message_handler(logging_handler(role.clone())).await;

        // Scheduled regardless of which adapter won construction; the
        // live-connection guard inside the loop decides per run.
        tokio::spawn(run_cleanup_loop(
            store,
            Arc::clone(&socket_slot),
            CleanupConfig {
                cron: config.session.cleanup_cron.clone(),
                utc_offset: config.session.utc_offset(),
                safe_age: config.session.safe_age(),
            },
            shutdown_tx.subscribe(),
        ));

        info!(role = %client.role(), adapter = %client.kind(), "logical client constructed");
        clients.push(client);
    }

    info!("waygate ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("received shutdown signal, initiating graceful shutdown");
    let _ = shutdown_tx.send(true);

    let deadline = Duration::from_secs(config.daemon.shutdown_timeout_seconds);
    for client in &clients {
        match tokio::time::timeout(deadline, client.disconnect()).await {
            Ok(Ok(())) => info!(role = %client.role(), "client disconnected"),
            Ok(Err(e)) => warn!(role = %client.role(), error = %e, "client teardown failed"),
            Err(_) => warn!(role = %client.role(), "client teardown timed out"),
        }
    }

    info!("waygate shut down cleanly");
    Ok(())
}

/// One-shot pairing flow: prints the code for the operator to enter on
/// the physical device.
async fn pair(role: &str, number: &str) -> Result<()> {
    logging::init_cli();
    let config = WaygateConfig::load().context("failed to load configuration")?;

    info!(role, "requesting pairing code");
    let socket_config = SocketConfig {
        gateway_url: config.gateway.url.clone(),
        ack_deadline: Duration::from_secs(config.gateway.ack_deadline_seconds),
    };

    let code = waygate::pairing::request_pairing_code(socket_config, number)
        .await
        .context("pairing code request failed")?;

    println!("Pairing code: {code}");
    println!("Enter it on the phone under Linked Devices > Link with phone number.");
    Ok(())
}

/// One-shot session-directory administration.
fn session_admin(command: SessionCommand) -> Result<()> {
    logging::init_cli();
    let config = WaygateConfig::load().context("failed to load configuration")?;

    match command {
        SessionCommand::Reset { role, number } => {
            let store = SessionStore::new(config.session_dir_for(&role));
            let deleted = store.delete_by_number(&number)?;
            println!("Deleted {deleted} artifact(s) for {number} in role {role}.");
        }
        SessionCommand::Prune { role } => {
            let store = SessionStore::new(config.session_dir_for(&role));
            let deleted = store.delete_by_patterns()?;
            println!("Pruned {deleted} ephemeral artifact(s) in role {role}.");
        }
        SessionCommand::Clear { role } => {
            let store = SessionStore::new(config.session_dir_for(&role));
            store.clear_all()?;
            println!("Cleared session directory for role {role}.");
        }
    }
    Ok(())
}

/// Factory constructing and connecting the socket adapter.
fn socket_factory(config: SocketConfig, store: SessionStore, slot: SocketHandle) -> TransportFactory {
    Box::new(move |events| {
        let config = config.clone();
        let store = store.clone();
        let slot = Arc::clone(&slot);
        Box::pin(async move {
            let transport: Arc<dyn Transport> =
                Arc::new(SocketTransport::new(config, store, events));
            transport.connect().await?;
            if let Ok(mut guard) = slot.lock() {
                *guard = Some(Arc::clone(&transport));
            }
            Ok(transport)
        })
    })
}

/// Factory constructing and connecting the web adapter.
fn web_factory(config: WebConfig) -> TransportFactory {
    Box::new(move |events| {
        let config = config.clone();
        Box::pin(async move {
            let transport: Arc<dyn Transport> = Arc::new(WebTransport::new(config, events));
            transport.connect().await?;
            Ok(transport)
        })
    })
}

/// Default business handler: structured log per inbound message.
fn logging_handler(role: String) -> MessageHandler {
    Arc::new(move |message: InboundMessage| {
        let role = role.clone();
        Box::pin(async move {
            info!(
                role = %role,
                from = %message.from,
                chars = message.body.chars().count(),
                "inbound message"
            );
            Ok(())
        })
    })
}
