//! outpost agent daemon
//!
//! Reads configuration change notifications as JSON lines, reconciles them
//! into the desired-state tree and keeps reverse tunnels to the configured
//! tunnel servers up until shut down.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use outpost_agent::source::{self, NotificationSource};
use outpost_agent::AgentState;
use outpost_core::config::{self, AgentConfig};
use outpost_core::SystemInfo;

#[derive(Parser)]
#[command(name = "outpost-agent")]
#[command(about = "outpost agent - keeps reverse tunnels to tunnel servers in line with config")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON-lines file of change notifications ("-" or unset reads stdin)
    #[arg(short, long)]
    notifications: Option<PathBuf>,

    /// TOML file overriding discovered system identity fields
    #[arg(long)]
    identity: Option<PathBuf>,

    /// Name to register under with tunnel servers
    #[arg(long)]
    agent_name: Option<String>,

    /// Dial every tunnel server from the agent's own network namespace
    #[arg(long)]
    no_namespaces: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Verbose output, same as --log-level debug
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("outpost agent starting...");

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    let mut config = if config_path.exists() {
        config::load_config::<AgentConfig>(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        tracing::debug!("No config at {:?}, using defaults", config_path);
        AgentConfig::default()
    };

    // Apply command-line overrides
    if let Some(name) = args.agent_name {
        config.agent_name = name;
    }
    if args.no_namespaces {
        config.use_namespaces = false;
    }
    if let Some(identity) = args.identity {
        config.identity_path = Some(identity);
    }

    let system = SystemInfo::load(config.identity_path.as_deref())
        .context("Failed to load system identity")?;
    tracing::info!(
        "Registering as {:?} from {:?} ({})",
        config.agent_name,
        system.name,
        if config.use_namespaces { "namespaced dialing" } else { "host dialing" }
    );

    let agent = AgentState::from_config(config, system);
    let feed_cancel = agent.shutdown.child_token();
    tokio::spawn(watch_signals(feed_cancel.clone()));

    let input = NotificationSource::from_arg(args.notifications.as_deref());
    let reader = input
        .open()
        .await
        .with_context(|| format!("Failed to open notification source {}", input))?;
    tracing::info!("Reading change notifications from {}", input);

    let mut reconciler = agent.reconciler();
    let fed = source::feed(reader, &mut reconciler, &feed_cancel).await;

    match fed {
        Ok(stats) => {
            tracing::info!(
                "Notification source {} finished: {} delivered, {} skipped",
                input,
                stats.delivered,
                stats.skipped
            );
            // End of input keeps the tunnels up until a signal arrives
            if !feed_cancel.is_cancelled() {
                feed_cancel.cancelled().await;
            }
        }
        Err(e) => tracing::error!("Notification source {} failed: {}", input, e),
    }

    tracing::info!("Shutting down");
    agent.shutdown().await;
    Ok(())
}

/// Cancel `cancel` on Ctrl-C or SIGTERM
async fn watch_signals(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                }
                cancel.cancel();
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C"),
            _ = terminate.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
        }
        tracing::info!("Received Ctrl-C");
    }

    cancel.cancel();
}
