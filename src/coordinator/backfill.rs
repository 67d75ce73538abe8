// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backfill: worker pool claiming older, not-yet-ingested sequences.
//!
//! Catches the store up between a configured oldest sequence and the
//! live tip. A planner scans the range newest-first, asking the tracker
//! which sequences are missing or pending, and feeds candidates into a
//! bounded queue; workers claim, fetch and apply them in any order.
//!
//! # Algorithm
//!
//! 1. Read the current tip; the range is `oldest_sequence ..= tip`
//! 2. Planner scans the range in chunks, newest first
//! 3. Missing and pending sequences are queued (failed too, when
//!    `retry_failed` is set)
//! 4. Each worker loops: claim → fetch → parse → upsert → complete
//! 5. The run ends when the range is exhausted and the queue drains
//!
//! Workers apply out of order; the tracker claim is the only exclusivity
//! needed, so a backfill pass stays correct even run as a separate
//! process against the same database file. The tip belongs to live-tail
//! and is never touched here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::BackfillConfig;
use crate::error::{IngestError, Result};
use crate::fetch::{DiffSource, FetchOutcome};
use crate::gateway::ChangesetGateway;
use crate::metrics;
use crate::tracker::{SequenceStatus, SequenceTracker};

use super::parse_diff;

/// Sequences examined per tracker query while planning.
const PLAN_CHUNK: u64 = 1_000;

/// Statistics from a backfill run.
#[derive(Debug, Default, Clone)]
pub struct BackfillStats {
    /// Sequences the planner queued.
    pub planned: u64,
    /// Sequences a worker claimed.
    pub claimed: u64,
    /// Sequences applied with data.
    pub applied: u64,
    /// Sequences that decoded to no events.
    pub empty: u64,
    /// Sequences recorded as failed.
    pub failed: u64,
    /// Claims lost to another worker or process.
    pub skipped_claimed: u64,
    /// Rows the gateway reported applied.
    pub events_applied: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct WorkerStats {
    claimed: u64,
    skipped_claimed: u64,
    applied: u64,
    empty: u64,
    failed: u64,
    events_applied: u64,
}

/// Run a backfill pass over everything below the current tip.
///
/// Terminates when the planner exhausts the range and the queue drains,
/// or on shutdown. Sequences claimed mid-shutdown either complete or
/// stay `processing` for the next start's stale-claim recovery.
pub async fn run_backfill<F, G>(
    fetcher: Arc<F>,
    tracker: SequenceTracker,
    gateway: Arc<G>,
    config: BackfillConfig,
    max_extent_degrees: f64,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<BackfillStats>
where
    F: DiffSource,
    G: ChangesetGateway,
{
    let span = tracing::info_span!("backfill");

    async move {
        let started = Instant::now();

        let tip = match tracker.get_tip().await? {
            Some(tip) => tip,
            None => {
                info!("No checkpoint yet, nothing to backfill");
                return Ok(BackfillStats::default());
            }
        };
        let oldest = config.oldest_sequence.max(1);
        if tip < oldest {
            info!(tip, oldest, "Nothing below the tip to backfill");
            return Ok(BackfillStats::default());
        }

        let worker_count = config.worker_count.max(1);
        info!(
            oldest,
            newest = tip,
            workers = worker_count,
            retry_failed = config.retry_failed,
            "Starting backfill"
        );

        let (tx, rx) = mpsc::channel::<u64>(worker_count * 2);
        let queue = Arc::new(Mutex::new(rx));

        let mut workers: JoinSet<Result<WorkerStats>> = JoinSet::new();
        for worker in 0..worker_count {
            workers.spawn(backfill_worker(
                worker,
                Arc::clone(&queue),
                Arc::clone(&fetcher),
                tracker.clone(),
                Arc::clone(&gateway),
                max_extent_degrees,
                shutdown_rx.clone(),
            ));
        }
        drop(queue);

        let planned = plan_range(&tracker, &config, oldest, tip, tx, &shutdown_rx).await?;

        let mut stats = BackfillStats {
            planned,
            ..Default::default()
        };
        let mut failure: Option<IngestError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(worker_stats)) => {
                    stats.claimed += worker_stats.claimed;
                    stats.skipped_claimed += worker_stats.skipped_claimed;
                    stats.applied += worker_stats.applied;
                    stats.empty += worker_stats.empty;
                    stats.failed += worker_stats.failed;
                    stats.events_applied += worker_stats.events_applied;
                }
                Ok(Err(e)) => {
                    failure = Some(e);
                    workers.shutdown().await;
                    break;
                }
                Err(e) => {
                    failure = Some(IngestError::Internal(format!(
                        "backfill worker panicked: {e}"
                    )));
                    workers.shutdown().await;
                    break;
                }
            }
        }

        if let Some(e) = failure {
            error!(
                claimed = stats.claimed,
                applied = stats.applied,
                error = %e,
                "Backfill aborted"
            );
            return Err(e);
        }

        stats.elapsed = started.elapsed();
        info!(
            planned = stats.planned,
            claimed = stats.claimed,
            applied = stats.applied,
            empty = stats.empty,
            failed = stats.failed,
            skipped_claimed = stats.skipped_claimed,
            events_applied = stats.events_applied,
            elapsed_secs = stats.elapsed.as_secs(),
            "Backfill complete"
        );
        Ok(stats)
    }
    .instrument(span)
    .await
}

/// Scan the range newest-first, queueing sequences that need work.
///
/// Failed sequences are reopened here rather than in the workers when
/// `retry_failed` is set, so workers only ever claim pending rows.
/// Returns how many sequences were queued.
async fn plan_range(
    tracker: &SequenceTracker,
    config: &BackfillConfig,
    oldest: u64,
    newest: u64,
    tx: mpsc::Sender<u64>,
    shutdown_rx: &watch::Receiver<bool>,
) -> Result<u64> {
    let mut planned = 0u64;
    let mut hi = newest;

    'scan: loop {
        if *shutdown_rx.borrow() {
            info!("Shutdown signal received, stopping backfill planner");
            break;
        }

        let lo = hi.saturating_sub(PLAN_CHUNK - 1).max(oldest);
        let known = tracker.statuses_in(lo..=hi).await?;

        for seq in (lo..=hi).rev() {
            let candidate = match known.get(&seq) {
                None => true,
                Some(SequenceStatus::Pending) => true,
                Some(SequenceStatus::Failed) if config.retry_failed => {
                    tracker.reopen_failed(seq).await?;
                    true
                }
                Some(_) => false,
            };
            if !candidate {
                continue;
            }
            // A closed queue means every worker is gone and the run is
            // aborting; the worker side carries the error.
            if tx.send(seq).await.is_err() {
                break 'scan;
            }
            planned += 1;
        }

        if lo == oldest {
            break;
        }
        hi = lo - 1;
    }

    metrics::record_backfill_planned(planned);
    debug!(planned, "Backfill planner finished");
    Ok(planned)
}

/// Worker loop: claim, fetch, parse, write, complete.
async fn backfill_worker<F, G>(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<u64>>>,
    fetcher: Arc<F>,
    tracker: SequenceTracker,
    gateway: Arc<G>,
    max_extent_degrees: f64,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<WorkerStats>
where
    F: DiffSource,
    G: ChangesetGateway,
{
    let mut stats = WorkerStats::default();
    loop {
        if *shutdown_rx.borrow() {
            debug!(worker, "Shutdown signal received, stopping backfill worker");
            break;
        }
        let seq = queue.lock().await.recv().await;
        let Some(seq) = seq else { break };

        if !tracker.try_claim(seq).await? {
            stats.skipped_claimed += 1;
            debug!(worker, sequence = seq, "Claim lost, skipping");
            continue;
        }
        stats.claimed += 1;

        let started = Instant::now();
        match fetcher.fetch(seq).await? {
            FetchOutcome::Ready(payload) => match parse_diff(&payload, max_extent_degrees) {
                Ok(events) if events.is_empty() => {
                    tracker.complete(seq, SequenceStatus::Empty, None).await?;
                    stats.empty += 1;
                }
                Ok(events) => match gateway.upsert_batch(&events).await {
                    Ok(applied) => {
                        tracker
                            .complete(seq, SequenceStatus::Backfilled, None)
                            .await?;
                        stats.applied += 1;
                        stats.events_applied += applied as u64;
                        metrics::record_backfill_applied(events.len(), started.elapsed());
                        debug!(
                            worker,
                            sequence = seq,
                            events = events.len(),
                            applied,
                            "Backfilled sequence"
                        );
                    }
                    Err(e) => {
                        warn!(worker, sequence = seq, error = %e, "Backfill write failed");
                        tracker
                            .complete(seq, SequenceStatus::Failed, Some(&e.to_string()))
                            .await?;
                        stats.failed += 1;
                    }
                },
                Err(e) => {
                    warn!(worker, sequence = seq, error = %e, "Backfill diff unreadable");
                    tracker
                        .complete(seq, SequenceStatus::Failed, Some(&e.to_string()))
                        .await?;
                    stats.failed += 1;
                }
            },
            FetchOutcome::NotYetPublished => {
                // Below the tip this is a hole on the server, not a
                // timing gap. Recorded failed so retry_failed can revisit.
                warn!(worker, sequence = seq, "Sequence missing upstream");
                tracker
                    .complete(seq, SequenceStatus::Failed, Some("not published upstream"))
                    .await?;
                stats.failed += 1;
            }
            FetchOutcome::Transient(error) | FetchOutcome::Failed(error) => {
                warn!(worker, sequence = seq, error = %error, "Backfill fetch failed");
                tracker
                    .complete(seq, SequenceStatus::Failed, Some(&error))
                    .await?;
                stats.failed += 1;
            }
        }
    }

    debug!(worker, claimed = stats.claimed, "Backfill worker finished");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::BoxFuture;
    use crate::store::SqliteStore;
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct ScriptedSource {
        outcomes: HashMap<u64, FetchOutcome>,
    }

    impl ScriptedSource {
        fn new() -> Self {
            Self {
                outcomes: HashMap::new(),
            }
        }

        fn ready(mut self, seq: u64, payload: &[u8]) -> Self {
            self.outcomes.insert(seq, FetchOutcome::Ready(payload.to_vec()));
            self
        }

        fn failed(mut self, seq: u64, error: &str) -> Self {
            self.outcomes
                .insert(seq, FetchOutcome::Failed(error.to_string()));
            self
        }
    }

    impl DiffSource for ScriptedSource {
        fn fetch(&self, seq: u64) -> BoxFuture<'_, FetchOutcome> {
            let outcome = match self.outcomes.get(&seq) {
                Some(FetchOutcome::Ready(bytes)) => FetchOutcome::Ready(bytes.clone()),
                Some(FetchOutcome::Transient(e)) => FetchOutcome::Transient(e.clone()),
                Some(FetchOutcome::Failed(e)) => FetchOutcome::Failed(e.clone()),
                Some(FetchOutcome::NotYetPublished) | None => FetchOutcome::NotYetPublished,
            };
            Box::pin(async move { Ok(outcome) })
        }

        fn current_remote_sequence(&self) -> BoxFuture<'_, u64> {
            Box::pin(async { Ok(0) })
        }
    }

    async fn fixture(dir: &tempfile::TempDir) -> (Arc<SqliteStore>, SequenceTracker) {
        let store = Arc::new(SqliteStore::open(dir.path().join("test.db")).await.unwrap());
        let tracker = SequenceTracker::new(store.pool().clone()).await.unwrap();
        (store, tracker)
    }

    fn diff_payload(ids: &[i64]) -> Vec<u8> {
        ids.iter()
            .map(|id| {
                format!(
                    r#"<changeset id="{id}" created_at="2021-03-01T00:00:00Z" open="true"/>"#
                )
            })
            .collect::<String>()
            .into_bytes()
    }

    fn test_config() -> BackfillConfig {
        BackfillConfig {
            enabled: true,
            worker_count: 2,
            oldest_sequence: 1,
            retry_failed: false,
        }
    }

    // The sender is dropped, which pins the watch value at false. Backfill
    // only samples the value, so this reads as "never shut down".
    fn not_shutdown() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn backfills_missing_and_pending_sequences() {
        let dir = tempdir().unwrap();
        let (store, tracker) = fixture(&dir).await;
        tracker.init_tip(5).await.unwrap();

        // Sequence 3 was already applied by live-tail.
        assert!(tracker.try_claim(3).await.unwrap());
        tracker
            .complete(3, SequenceStatus::Success, None)
            .await
            .unwrap();

        let source = Arc::new(
            ScriptedSource::new()
                .ready(1, &diff_payload(&[10]))
                .ready(2, &diff_payload(&[20, 21]))
                .ready(4, &diff_payload(&[40]))
                .ready(5, &diff_payload(&[50])),
        );

        let stats = run_backfill(
            source,
            tracker.clone(),
            Arc::clone(&store),
            test_config(),
            10.0,
            not_shutdown(),
        )
        .await
        .unwrap();

        assert_eq!(stats.planned, 4);
        assert_eq!(stats.claimed, 4);
        assert_eq!(stats.applied, 4);
        assert_eq!(stats.events_applied, 5);
        assert_eq!(stats.failed, 0);
        assert_eq!(
            tracker.status_of(1).await.unwrap(),
            Some(SequenceStatus::Backfilled)
        );
        assert_eq!(
            tracker.status_of(3).await.unwrap(),
            Some(SequenceStatus::Success)
        );
        assert_eq!(store.changeset_count().await.unwrap(), 5);
        store.close().await;
    }

    #[tokio::test]
    async fn empty_diff_marked_empty() {
        let dir = tempdir().unwrap();
        let (store, tracker) = fixture(&dir).await;
        tracker.init_tip(1).await.unwrap();

        let source = Arc::new(ScriptedSource::new().ready(1, b""));
        let stats = run_backfill(
            source,
            tracker.clone(),
            Arc::clone(&store),
            test_config(),
            10.0,
            not_shutdown(),
        )
        .await
        .unwrap();

        assert_eq!(stats.empty, 1);
        assert_eq!(
            tracker.status_of(1).await.unwrap(),
            Some(SequenceStatus::Empty)
        );
        store.close().await;
    }

    #[tokio::test]
    async fn missing_upstream_sequence_marked_failed() {
        let dir = tempdir().unwrap();
        let (store, tracker) = fixture(&dir).await;
        tracker.init_tip(1).await.unwrap();

        let source = Arc::new(ScriptedSource::new());
        let stats = run_backfill(
            source,
            tracker.clone(),
            Arc::clone(&store),
            test_config(),
            10.0,
            not_shutdown(),
        )
        .await
        .unwrap();

        assert_eq!(stats.failed, 1);
        let record = tracker.record_of(1).await.unwrap().unwrap();
        assert_eq!(record.status, SequenceStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("not published upstream"));
        store.close().await;
    }

    #[tokio::test]
    async fn failed_sequences_skipped_unless_retry_enabled() {
        let dir = tempdir().unwrap();
        let (store, tracker) = fixture(&dir).await;
        tracker.init_tip(2).await.unwrap();

        assert!(tracker.try_claim(1).await.unwrap());
        tracker
            .complete(1, SequenceStatus::Failed, Some("old wound"))
            .await
            .unwrap();
        assert!(tracker.try_claim(2).await.unwrap());
        tracker
            .complete(2, SequenceStatus::Success, None)
            .await
            .unwrap();

        // First pass: retry_failed off, nothing to do.
        let source = Arc::new(ScriptedSource::new().ready(1, &diff_payload(&[10])));
        let stats = run_backfill(
            Arc::clone(&source),
            tracker.clone(),
            Arc::clone(&store),
            test_config(),
            10.0,
            not_shutdown(),
        )
        .await
        .unwrap();
        assert_eq!(stats.planned, 0);
        assert_eq!(
            tracker.status_of(1).await.unwrap(),
            Some(SequenceStatus::Failed)
        );

        // Second pass: retry_failed picks it back up.
        let mut config = test_config();
        config.retry_failed = true;
        let stats = run_backfill(
            source,
            tracker.clone(),
            Arc::clone(&store),
            config,
            10.0,
            not_shutdown(),
        )
        .await
        .unwrap();
        assert_eq!(stats.planned, 1);
        assert_eq!(stats.applied, 1);
        assert_eq!(
            tracker.status_of(1).await.unwrap(),
            Some(SequenceStatus::Backfilled)
        );
        store.close().await;
    }

    #[tokio::test]
    async fn respects_oldest_sequence_boundary() {
        let dir = tempdir().unwrap();
        let (store, tracker) = fixture(&dir).await;
        tracker.init_tip(5).await.unwrap();

        let source = Arc::new(
            ScriptedSource::new()
                .ready(4, &diff_payload(&[40]))
                .ready(5, &diff_payload(&[50])),
        );
        let mut config = test_config();
        config.oldest_sequence = 4;

        let stats = run_backfill(
            source,
            tracker.clone(),
            Arc::clone(&store),
            config,
            10.0,
            not_shutdown(),
        )
        .await
        .unwrap();

        assert_eq!(stats.planned, 2);
        assert_eq!(tracker.status_of(3).await.unwrap(), None);
        store.close().await;
    }

    #[tokio::test]
    async fn no_checkpoint_means_nothing_to_do() {
        let dir = tempdir().unwrap();
        let (store, tracker) = fixture(&dir).await;

        let source = Arc::new(ScriptedSource::new());
        let stats = run_backfill(
            source,
            tracker.clone(),
            Arc::clone(&store),
            test_config(),
            10.0,
            not_shutdown(),
        )
        .await
        .unwrap();

        assert_eq!(stats.planned, 0);
        assert_eq!(stats.claimed, 0);
        store.close().await;
    }

    #[tokio::test]
    async fn shutdown_before_start_plans_nothing() {
        let dir = tempdir().unwrap();
        let (store, tracker) = fixture(&dir).await;
        tracker.init_tip(100).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(true);
        let source = Arc::new(ScriptedSource::new());

        let stats = run_backfill(
            source,
            tracker.clone(),
            Arc::clone(&store),
            test_config(),
            10.0,
            shutdown_rx,
        )
        .await
        .unwrap();

        drop(shutdown_tx);
        assert_eq!(stats.planned, 0);
        assert_eq!(stats.claimed, 0);
        store.close().await;
    }

    #[tokio::test]
    async fn fetch_error_on_one_sequence_does_not_stop_others() {
        let dir = tempdir().unwrap();
        let (store, tracker) = fixture(&dir).await;
        tracker.init_tip(3).await.unwrap();

        let source = Arc::new(
            ScriptedSource::new()
                .ready(1, &diff_payload(&[10]))
                .failed(2, "gone")
                .ready(3, &diff_payload(&[30])),
        );

        let stats = run_backfill(
            source,
            tracker.clone(),
            Arc::clone(&store),
            test_config(),
            10.0,
            not_shutdown(),
        )
        .await
        .unwrap();

        assert_eq!(stats.applied, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(
            tracker.status_of(2).await.unwrap(),
            Some(SequenceStatus::Failed)
        );
        store.close().await;
    }
}
