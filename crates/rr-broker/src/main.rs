//! Remote Relay Broker Daemon
//!
//! Accepts agent connections and relays operator commands to them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rr_broker::api::ApiServer;
use rr_broker::monitor::HealthMonitor;
use rr_broker::server::AgentListener;
use rr_broker::store::BrokerStore;
use rr_broker::BrokerState;
use rr_core::config::{self, BrokerConfig};

#[derive(Parser)]
#[command(name = "rr-broker")]
#[command(about = "Remote Relay broker daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Agent listener bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// API port on localhost (overrides config)
    #[arg(long)]
    api_port: Option<u16>,

    /// Database path (overrides config)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Remote Relay broker starting...");

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_broker_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                BrokerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            BrokerConfig::default()
        }
    };

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.api_port {
        config.api_port = port;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }
    config.validate().context("Invalid broker configuration")?;

    if config.api_key.is_none() {
        tracing::warn!("No api_key configured - any local process can issue commands");
    }

    let store = BrokerStore::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {:?}", config.database_path))?;

    let bind_addr = config.bind_address.clone();
    let state = Arc::new(BrokerState::new(config, store));

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let monitor = HealthMonitor::new(Arc::clone(&state)).spawn(cancel.clone());

    let api = ApiServer::new(Arc::clone(&state), cancel.clone());
    let api_cancel = cancel.clone();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api.run().await {
            tracing::error!("API server failed: {:#}", e);
            api_cancel.cancel();
        }
    });

    let listener = AgentListener::new(Arc::clone(&state), cancel.clone());
    let result = listener.run(&bind_addr).await;

    // Whatever stopped the listener stops everything else
    cancel.cancel();
    let _ = api_task.await;
    let _ = monitor.await;
    state.shutdown().await;

    result?;
    tracing::info!("Broker shutdown complete");
    Ok(())
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}
