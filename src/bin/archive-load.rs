//! archive-load: one-shot bulk import of a changeset archive.
//!
//! Reads a planet-style archive dump (XML, optionally gzip or zstd
//! compressed), filters it, and loads it into the SQLite store. Run
//! this once before starting `sync-daemon`; replication keeps the
//! store current from there.
//!
//! Exits non-zero when the load aborts. Partial data may remain;
//! re-running with `--truncate` starts clean.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use changeset_sync::{load_archive, SqliteStore, SyncConfig};

/// Bulk-load a changeset archive dump into the local store.
#[derive(Parser, Debug)]
#[command(name = "archive-load", version, about)]
struct Cli {
    /// Path to the archive file (.xml, .xml.gz or .xml.zst).
    archive: PathBuf,

    /// Path to a TOML config file.
    #[arg(long, env = "CHANGESET_CONFIG")]
    config: Option<String>,

    /// Override the store database path.
    #[arg(long, env = "CHANGESET_DB_PATH")]
    db_path: Option<String>,

    /// Empty the changesets table before loading.
    #[arg(long)]
    truncate: bool,

    /// Only load changesets created on or after this day (YYYY-MM-DD).
    #[arg(long)]
    from_date: Option<String>,

    /// Only load changesets created on or before this day (YYYY-MM-DD).
    #[arg(long)]
    to_date: Option<String>,

    /// Worker tasks applying batches.
    #[arg(long)]
    workers: Option<usize>,
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
    if cli.truncate {
        config.archive.truncate = true;
    }
    if cli.from_date.is_some() {
        config.archive.from_date = cli.from_date;
    }
    if cli.to_date.is_some() {
        config.archive.to_date = cli.to_date;
    }
    if let Some(workers) = cli.workers {
        config.archive.worker_count = workers;
    }
    config.validate()?;

    info!(
        archive = %cli.archive.display(),
        store = %config.store.path,
        "Starting archive load"
    );

    let store = Arc::new(SqliteStore::open(&config.store.path).await?);
    let stats = load_archive(
        &cli.archive,
        &config.archive,
        config.store.max_bbox_extent_degrees,
        Arc::clone(&store),
    )
    .await?;
    store.close().await;

    info!(
        events = stats.events_parsed,
        rows = stats.rows_applied,
        skipped = stats.skipped_malformed,
        elapsed_secs = stats.elapsed.as_secs(),
        "Archive load complete"
    );

    Ok(())
}
