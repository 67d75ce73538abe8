//! sync-daemon: long-running changeset replication daemon.
//!
//! Opens the store, starts the sync engine (live-tail plus optional
//! backfill), and runs until SIGINT or SIGTERM. Shutdown drains the
//! coordinator tasks before closing the store, so a restart resumes
//! from the durable checkpoint.
//!
//! While running, a health line is logged periodically with the tip,
//! backlog and failure counts.

use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use changeset_sync::{SyncConfig, SyncEngine};

/// Run the changeset replication daemon.
#[derive(Parser, Debug)]
#[command(name = "sync-daemon", version, about)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, env = "CHANGESET_CONFIG")]
    config: Option<String>,

    /// Override the store database path.
    #[arg(long, env = "CHANGESET_DB_PATH")]
    db_path: Option<String>,

    /// Start sequence used when the checkpoint is empty.
    #[arg(long)]
    start_sequence: Option<u64>,

    /// Disable the backfill pool for this run.
    #[arg(long)]
    no_backfill: bool,

    /// Health log interval in seconds.
    #[arg(long, env = "CHANGESET_HEALTH_INTERVAL", default_value_t = 60)]
    health_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::from_env()?,
    };
    if let Some(db_path) = cli.db_path {
        config.store.path = db_path;
    }
    if cli.start_sequence.is_some() {
        config.live_tail.start_sequence = cli.start_sequence;
    }
    if cli.no_backfill {
        config.backfill.enabled = false;
    }
    config.validate()?;

    let mut engine = SyncEngine::open(config).await?;
    engine.start().await?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut health_timer = tokio::time::interval(Duration::from_secs(cli.health_interval.max(1)));

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = health_timer.tick() => {
                match engine.health_check().await {
                    Ok(health) => info!(
                        state = %health.state,
                        tip = health.current_tip,
                        backlog = ?health.backlog,
                        failed = health.failed_sequences,
                        changesets = health.changeset_count,
                        "Health"
                    ),
                    Err(e) => warn!(error = %e, "Health check failed"),
                }
            }
        }
    }

    info!("Shutdown signal received");
    engine.shutdown().await;

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }
}
