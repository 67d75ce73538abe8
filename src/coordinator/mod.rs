// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle and the coordinators it runs.
//!
//! The engine ties together:
//! - Live-tail polling of the newest sequences via [`run_live_tail`]
//! - Backfill of older sequences via [`run_backfill`]
//! - Durable progress via [`crate::tracker::SequenceTracker`]
//! - Changeset persistence via [`crate::store::SqliteStore`]
//!
//! # Lifecycle
//!
//! 1. [`SyncEngine::open`] opens the store and tracker
//! 2. [`SyncEngine::start`] releases stale claims and spawns the
//!    coordinators
//! 3. [`SyncEngine::shutdown`] signals the shared watch channel, joins
//!    tasks with a drain timeout, and closes the store
//!
//! Both coordinators answer to the same shutdown channel and claim
//! through the same tracker, so live-tail and backfill never
//! double-apply a sequence even though they run concurrently.

mod types;
mod live_tail;
mod backfill;

pub use backfill::{run_backfill, BackfillStats};
pub use live_tail::run_live_tail;
pub use types::{EngineState, HealthCheck};

use crate::config::SyncConfig;
use crate::diff::{decompress_payload, filter_oversized, ChangesetEvent, ChangesetReader};
use crate::error::{IngestError, Result};
use crate::fetch::{DiffSource, ReplicationClient};
use crate::metrics;
use crate::store::SqliteStore;
use crate::tracker::{SequenceStatus, SequenceTracker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Claims older than this are treated as stranded by a dead process
/// and released at startup.
const STALE_CLAIM_AGE: Duration = Duration::from_secs(600);

/// Decode one replication diff payload into events ready for the
/// gateway.
///
/// Handles gzip and zstd transparently. Malformed elements were already
/// skipped by the reader; oversized bounding boxes are dropped here so
/// neither coordinator ever writes them.
pub(crate) fn parse_diff(payload: &[u8], max_extent_degrees: f64) -> Result<Vec<ChangesetEvent>> {
    let decoded = decompress_payload(payload)?;
    let mut reader = ChangesetReader::new(decoded.as_slice());
    let mut events = Vec::new();
    while let Some(event) = reader.next_event()? {
        events.push(event);
    }
    filter_oversized(&mut events, max_extent_degrees);
    Ok(events)
}

/// Sleep for `duration`, waking early on shutdown.
///
/// Returns `true` when the caller should stop, including the case where
/// the shutdown sender is gone.
pub(crate) async fn sleep_or_shutdown(
    duration: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        biased;
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
        _ = tokio::time::sleep(duration) => false,
    }
}

/// The sync engine: live-tail plus optional backfill over one store.
///
/// # Ownership
///
/// The engine owns the SQLite store and the sequence tracker; the
/// coordinators it spawns share both. The diff source is generic so
/// tests and embedders can substitute their own transport; production
/// uses [`ReplicationClient`].
///
/// Archive loading is not part of the engine lifecycle. It is a
/// one-shot bulk operation run before the first start, see
/// [`crate::archive::load_archive`].
pub struct SyncEngine<F: DiffSource = ReplicationClient> {
    /// Configuration, fixed for the life of the engine.
    config: SyncConfig,

    /// Changeset store, shared with the spawned coordinators.
    store: Arc<SqliteStore>,

    /// Per-sequence status and the contiguous tip.
    tracker: SequenceTracker,

    /// Where diffs come from.
    fetcher: Arc<F>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver, cloned into every spawned task
    shutdown_rx: watch::Receiver<bool>,

    /// Handles of the spawned coordinator tasks.
    task_handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl SyncEngine<ReplicationClient> {
    /// Open an engine with an HTTP fetcher built from the replication
    /// settings.
    ///
    /// The engine starts in `Created` state. Call
    /// [`start()`](Self::start) to begin syncing.
    pub async fn open(config: SyncConfig) -> Result<Self> {
        let fetcher = Arc::new(ReplicationClient::new(&config.replication)?);
        Self::with_source(config, fetcher).await
    }
}

impl<F: DiffSource> SyncEngine<F> {
    /// Open an engine with a caller-supplied diff source.
    ///
    /// Validates the configuration and opens the store and tracker, so
    /// a bad path or bad settings fail here rather than inside a
    /// spawned task.
    pub async fn with_source(config: SyncConfig, fetcher: Arc<F>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(SqliteStore::open(&config.store.path).await?);
        let tracker = SequenceTracker::new(store.pool().clone()).await?;

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            store,
            tracker,
            fetcher,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            task_handles: RwLock::new(Vec::new()),
        })
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// A receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Whether the engine is in the `Running` state.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// The underlying changeset store.
    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// The sequence tracker (for diagnostics and tools).
    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    /// Snapshot of engine and store health for monitoring.
    ///
    /// Performs a handful of point queries against SQLite plus one
    /// best-effort remote state fetch; when the remote is unreachable
    /// `remote_sequence` and `backlog` are left unset rather than
    /// failing the whole check.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let health = engine.health_check().await?;
    /// if !health.healthy {
    ///     eprintln!("tip stuck at {}", health.current_tip);
    /// }
    /// ```
    pub async fn health_check(&self) -> Result<HealthCheck> {
        let state = self.state();

        let checkpoint = self.tracker.get_checkpoint().await?;
        let (current_tip, last_processed) = checkpoint
            .map(|c| (c.current_tip, c.last_processed))
            .unwrap_or((0, 0));

        let counts = self.tracker.counts_by_status().await?;
        let count_of = |status: SequenceStatus| counts.get(&status).copied().unwrap_or(0);
        let pending_sequences = count_of(SequenceStatus::Pending);
        let processing_sequences = count_of(SequenceStatus::Processing);
        let failed_sequences = count_of(SequenceStatus::Failed);

        let changeset_count = self.store.changeset_count().await?;

        let remote_sequence = match self.fetcher.current_remote_sequence().await {
            Ok(seq) => Some(seq),
            Err(e) => {
                debug!(error = %e, "Remote sequence unavailable for health check");
                None
            }
        };
        let backlog = remote_sequence.map(|remote| remote.saturating_sub(current_tip));
        if let Some(backlog) = backlog {
            metrics::record_backlog(backlog);
        }

        let healthy = state == EngineState::Running && failed_sequences == 0;

        Ok(HealthCheck {
            state,
            healthy,
            current_tip,
            last_processed,
            pending_sequences,
            processing_sequences,
            failed_sequences,
            remote_sequence,
            backlog,
            changeset_count,
        })
    }

    /// Start the engine.
    ///
    /// 1. Releases claims stranded by an unclean stop
    /// 2. Spawns the live-tail coordinator
    /// 3. Spawns a backfill pass when enabled
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(IngestError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            remote = %self.config.replication.base_url,
            store = %self.config.store.path,
            backfill = self.config.backfill.enabled,
            "Starting sync engine"
        );
        let _ = self.state_tx.send(EngineState::Starting);
        metrics::set_engine_state("Starting");

        let reclaimed = self.tracker.release_stale(STALE_CLAIM_AGE).await?;
        if reclaimed > 0 {
            info!(reclaimed, "Released stale claims from a previous run");
        }

        self.spawn_live_tail().await;
        if self.config.backfill.enabled {
            self.spawn_backfill().await;
        }

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        info!("Sync engine running");

        Ok(())
    }

    /// Spawn the live-tail coordinator task.
    ///
    /// A live-tail failure is fatal for the engine: the tip can no
    /// longer advance, so the state flips to `Failed` for watchers.
    async fn spawn_live_tail(&self) {
        let fetcher = Arc::clone(&self.fetcher);
        let tracker = self.tracker.clone();
        let gateway = Arc::clone(&self.store);
        let config = self.config.live_tail.clone();
        let max_extent = self.config.store.max_bbox_extent_degrees;
        let shutdown_rx = self.shutdown_rx.clone();
        let state_tx = self.state_tx.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) =
                run_live_tail(fetcher, tracker, gateway, config, max_extent, shutdown_rx).await
            {
                error!(error = %e, "Live-tail coordinator failed");
                let _ = state_tx.send(EngineState::Failed);
                metrics::set_engine_state("Failed");
            }
        });

        info!("Spawned live-tail coordinator");
        self.task_handles.write().await.push(handle);
    }

    /// Spawn a one-shot backfill pass.
    ///
    /// A failed pass does not stop live-tail; whatever the pass left
    /// claimed is released as stale on the next start.
    async fn spawn_backfill(&self) {
        let fetcher = Arc::clone(&self.fetcher);
        let tracker = self.tracker.clone();
        let gateway = Arc::clone(&self.store);
        let config = self.config.backfill.clone();
        let max_extent = self.config.store.max_bbox_extent_degrees;
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) =
                run_backfill(fetcher, tracker, gateway, config, max_extent, shutdown_rx).await
            {
                error!(error = %e, "Backfill pass failed");
            }
        });

        info!("Spawned backfill pass");
        self.task_handles.write().await.push(handle);
    }

    /// Shut the engine down gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal all coordinator tasks to stop
    /// 2. Join them with a drain timeout
    /// 3. Close the store (includes WAL checkpoint)
    pub async fn shutdown(&mut self) {
        info!("Shutting down sync engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.task_handles.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for coordinator tasks to finish");
        }

        let drain_timeout = Duration::from_secs(10);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown");
                }
            }
        }

        self.store.close().await;

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Sync engine stopped");
    }
}
