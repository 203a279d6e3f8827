//! Dandelions: run a Nostr agent across many relays.

mod config;
mod handler;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::AppConfig;
use handler::LogHandler;
use nostr::{KIND_ENCRYPTED_DIRECT_MESSAGE, KIND_SHORT_TEXT_NOTE};
use nostr_client::{DispatchEngine, Filter, LinkState, WebSocketTransport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(
    name = "dandelions",
    about = "Nostr agent runner: multi-relay ingestion, dedup and dispatch",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent until Ctrl-C
    Start(ConfigArgs),
    /// Connect to every relay once and report its state
    Check(ConfigArgs),
    /// Print the effective relay list
    Relays(ConfigArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Path to the TOML config file (defaults to ./dandelions.toml when present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> Result<AppConfig> {
        AppConfig::load(self.config.as_deref())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Start(args) => start(args.load()?).await,
        Commands::Check(args) => check(args.load()?).await,
        Commands::Relays(args) => {
            for relay in &args.load()?.engine.relays {
                println!("{}", relay);
            }
            Ok(())
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Live text notes and DMs addressed to the agent, or every live text note
/// when no agent key is configured.
fn agent_filters(config: &AppConfig) -> Vec<Filter> {
    let since = now();
    match &config.agent.pubkey {
        Some(pubkey) => vec![
            Filter::new()
                .kinds(vec![KIND_SHORT_TEXT_NOTE, KIND_ENCRYPTED_DIRECT_MESSAGE])
                .pubkey_refs(vec![pubkey.clone()])
                .since(since),
        ],
        None => vec![Filter::new().kinds(vec![KIND_SHORT_TEXT_NOTE]).since(since)],
    }
}

async fn start(config: AppConfig) -> Result<()> {
    let filters = agent_filters(&config);
    let engine = Arc::new(
        DispatchEngine::new(config.engine, Arc::new(WebSocketTransport))
            .context("failed to build dispatch engine")?,
    );

    engine.run_handler(Arc::new(LogHandler))?;
    engine.start().await?;
    let subscription = engine.subscribe(filters, &[]).await?;
    info!(subscription = %subscription.id, relays = subscription.relays.len(), "Listening");

    let mut state_changes = engine.state_changes();
    let watcher = tokio::spawn(async move {
        while let Ok(change) = state_changes.recv().await {
            if let Some(error) = change.error {
                warn!(relay = %change.relay_url, state = ?change.current, "{}", error);
            } else {
                info!(relay = %change.relay_url, state = ?change.current, "Relay state changed");
            }
        }
    });

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");

    engine.shutdown().await;
    watcher.abort();

    let snapshot = engine.snapshot();
    info!(
        delivered = snapshot.metrics.delivered,
        dedup_hit_rate = snapshot.dedup_hit_rate,
        published = snapshot.metrics.publish_acked,
        "Stopped"
    );
    Ok(())
}

async fn check(config: AppConfig) -> Result<()> {
    let engine = DispatchEngine::new(config.engine, Arc::new(WebSocketTransport))
        .context("failed to build dispatch engine")?;
    engine.start().await?;

    let health = engine.health();
    println!("{:<40} {:<14} ERROR", "RELAY", "STATE");
    for endpoint in &health {
        println!(
            "{:<40} {:<14} {}",
            endpoint.url,
            format!("{:?}", endpoint.state),
            endpoint.last_error.as_deref().unwrap_or("-")
        );
    }
    let connected = health
        .iter()
        .filter(|endpoint| endpoint.state == LinkState::Connected)
        .count();
    println!("{}/{} relays connected", connected, health.len());

    engine.shutdown().await;
    if connected == 0 {
        anyhow::bail!("no relay reachable");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
        let cli = Cli::try_parse_from(["dandelions", "check", "--config", "x.toml"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Check(ConfigArgs { config: Some(ref path) }) if path == &PathBuf::from("x.toml")
        ));
    }

    #[test]
    fn test_agent_filters() {
        let mut config = AppConfig::default();
        let filters = agent_filters(&config);
        assert_eq!(filters[0].kinds, Some(vec![KIND_SHORT_TEXT_NOTE]));

        config.agent.pubkey = Some("ab".repeat(32));
        let filters = agent_filters(&config);
        assert_eq!(
            filters[0].kinds,
            Some(vec![KIND_SHORT_TEXT_NOTE, KIND_ENCRYPTED_DIRECT_MESSAGE])
        );
        assert_eq!(filters[0].tags.get("#p"), Some(&vec!["ab".repeat(32)]));
    }
}
