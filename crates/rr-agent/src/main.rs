//! Remote Relay Agent Daemon
//!
//! Runs on a managed machine, connects out to the broker, and executes the
//! commands relayed to it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rr_agent::bridge::{self, SessionBridge};
use rr_agent::handlers::{self, DesktopAccess};
use rr_agent::{AgentRunner, AgentState};
use rr_core::config::{self, AgentConfig};
use rr_core::ConfigError;

#[derive(Parser)]
#[command(name = "rr-agent")]
#[command(about = "Remote Relay agent - executes relayed commands on this machine")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker address, host:port (overrides config)
    #[arg(short, long)]
    broker: Option<String>,

    /// One-time pairing code from the broker
    /// Example: ABC234
    #[arg(long)]
    code: Option<String>,

    /// Display name reported to the broker (defaults to hostname)
    #[arg(long)]
    name: Option<String>,

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

    tracing::info!("Remote Relay agent starting...");

    // Load configuration
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_agent_config_path);

    let mut config: AgentConfig = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(ConfigError::NotFound(_)) => {
            tracing::info!("No config at {:?}, using defaults", config_path);
            AgentConfig::default()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to load config from {:?}", config_path))
        }
    };

    // Apply command-line overrides
    let mut changed = false;
    if let Some(broker) = args.broker {
        config.broker_address = broker;
        changed = true;
    }
    if let Some(code) = args.code {
        if config.is_paired() {
            tracing::warn!("Agent is already paired; ignoring --code");
        } else {
            config.pairing_code = Some(code.trim().to_uppercase());
            changed = true;
        }
    }
    if let Some(name) = args.name {
        config.friendly_name = Some(name);
        changed = true;
    }
    config
        .validate()
        .context("Invalid agent configuration (pair with --code <CODE>)")?;

    // Keep overrides so the paired credential lands next to them
    if changed {
        config::save_config(&config_path, &config)
            .with_context(|| format!("Failed to save config to {:?}", config_path))?;
    }

    tracing::info!("Broker: {}", config.broker_address);
    if !config.is_paired() {
        tracing::info!("Not paired yet; registering with pairing code");
    }

    // Create cancellation token for graceful shutdown
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let desktop = desktop_access(&config, &shutdown);
    let executor = handlers::default_executor(&config, desktop);
    let state = Arc::new(AgentState::new(config, Some(config_path)));

    AgentRunner::new(state, executor)
        .run(shutdown)
        .await
        .context("Agent stopped")?;

    tracing::info!("Agent shutdown complete");
    Ok(())
}

/// Use the session bridge when running without a desktop of our own
fn desktop_access(config: &AgentConfig, shutdown: &CancellationToken) -> DesktopAccess {
    let wanted = config
        .bridge
        .enabled
        .unwrap_or_else(bridge::running_without_desktop);
    if !wanted {
        return DesktopAccess::Direct;
    }

    match bridge::platform_host() {
        Some(host) => {
            tracing::info!(
                "Desktop commands run through the session bridge ({:?})",
                config.bridge.staging_dir
            );
            DesktopAccess::Bridged(Arc::new(SessionBridge::new(
                host,
                config.bridge.clone(),
                shutdown.child_token(),
            )))
        }
        None => {
            tracing::warn!("Session bridge is not supported on this platform");
            DesktopAccess::Direct
        }
    }
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
                tracing::info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, shutting down...");
            }
        }

        cancel.cancel();
    });
}
