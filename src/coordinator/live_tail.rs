//! Live tail: single forward loop applying newly published sequences.
//!
//! The tip only moves through this loop: fetch `tip + 1`, apply it,
//! advance, try the next with no sleep. When the upstream runs dry the
//! loop polls at `poll_interval`. Backfill workers never touch the tip.
//!
//! # Sequence Handling
//!
//! ```text
//! Ready           ─▶ parse ─▶ claim ─▶ upsert ─▶ complete ─▶ advance tip
//! NotYetPublished ─▶ sleep poll_interval, retry the same sequence
//! Failed          ─▶ record failed, sleep, reopen, retry the same sequence
//! ```
//!
//! The tip never advances past a failed sequence. A poisoned diff halts
//! forward progress visibly (logs, metrics, the sequences table) instead
//! of leaving a silent hole behind the tip.
//!
//! # Graceful Shutdown
//!
//! Every fetch and sleep races a shutdown watch via `tokio::select!`.
//! An in-flight sequence either completes or stays `processing` for the
//! next start's stale-claim recovery.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

use crate::config::LiveTailConfig;
use crate::error::Result;
use crate::fetch::{DiffSource, FetchOutcome};
use crate::gateway::ChangesetGateway;
use crate::metrics;
use crate::tracker::{SequenceStatus, SequenceTracker};

use super::{parse_diff, sleep_or_shutdown};

/// What became of one Ready sequence.
enum Applied {
    /// Committed and the tip advanced; move on immediately.
    Advanced,
    /// Applied elsewhere or the tip moved under us; resync and move on.
    TipMoved,
    /// Claim held by another worker; wait and re-check.
    Busy,
    /// Recorded as failed; the tip stays put.
    Failed,
}

/// Run the live-tail loop until shutdown.
///
/// Bootstraps an empty checkpoint from `start_sequence` or the remote
/// state file, then applies sequences strictly in order.
pub async fn run_live_tail<F, G>(
    fetcher: Arc<F>,
    tracker: SequenceTracker,
    gateway: Arc<G>,
    config: LiveTailConfig,
    max_extent_degrees: f64,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()>
where
    F: DiffSource,
    G: ChangesetGateway,
{
    let span = tracing::info_span!("live_tail");

    async move {
        // Mark the initial shutdown value as seen so changed() only
        // fires on actual changes.
        let _ = shutdown_rx.borrow_and_update();

        let poll_interval = config.poll_interval();
        let mut tip = match tracker.get_tip().await? {
            Some(tip) => tip,
            None => bootstrap_checkpoint(fetcher.as_ref(), &tracker, &config).await?,
        };

        info!(
            next_sequence = tip + 1,
            poll_secs = poll_interval.as_secs(),
            "Starting live-tail"
        );

        loop {
            let next = tip + 1;

            let outcome = tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping live-tail");
                        break;
                    }
                    continue;
                }

                outcome = fetcher.fetch(next) => outcome?,
            };

            match outcome {
                FetchOutcome::Ready(payload) => {
                    let applied = apply_ready(
                        next,
                        &payload,
                        &tracker,
                        gateway.as_ref(),
                        max_extent_degrees,
                    )
                    .await?;

                    match applied {
                        Applied::Advanced => {
                            tip = next;
                        }
                        Applied::TipMoved => {
                            tip = tracker.get_tip().await?.unwrap_or(tip);
                        }
                        Applied::Busy => {
                            debug!(sequence = next, "Sequence claimed elsewhere, waiting");
                            if sleep_or_shutdown(poll_interval, &mut shutdown_rx).await {
                                break;
                            }
                            tip = tracker.get_tip().await?.unwrap_or(tip);
                        }
                        Applied::Failed => {
                            if sleep_or_shutdown(poll_interval, &mut shutdown_rx).await {
                                break;
                            }
                            if tracker.reopen_failed(next).await? {
                                info!(sequence = next, "Reopened failed sequence for retry");
                            }
                        }
                    }
                }
                FetchOutcome::NotYetPublished => {
                    debug!(sequence = next, "Next sequence not yet published");
                    if sleep_or_shutdown(poll_interval, &mut shutdown_rx).await {
                        break;
                    }
                }
                FetchOutcome::Transient(error) | FetchOutcome::Failed(error) => {
                    warn!(sequence = next, error = %error, "Sequence fetch failed");
                    record_failure(&tracker, next, &error).await?;
                    if sleep_or_shutdown(poll_interval, &mut shutdown_rx).await {
                        break;
                    }
                    if tracker.reopen_failed(next).await? {
                        info!(sequence = next, "Reopened failed sequence for retry");
                    }
                }
            }
        }

        Ok(())
    }
    .instrument(span)
    .await
}

/// Seed the checkpoint for a first run.
///
/// A configured `start_sequence` wins; otherwise the upstream state file
/// names the starting point. The stored tip is one below the first
/// sequence to ingest, and an already-seeded checkpoint is never rewound.
async fn bootstrap_checkpoint<F: DiffSource>(
    fetcher: &F,
    tracker: &SequenceTracker,
    config: &LiveTailConfig,
) -> Result<u64> {
    let start = match config.start_sequence {
        Some(seq) => {
            info!(start_sequence = seq, "Using configured start sequence");
            seq.max(1)
        }
        None => {
            let remote = fetcher.current_remote_sequence().await?;
            info!(remote_sequence = remote, "Discovered remote sequence for bootstrap");
            remote.max(1)
        }
    };

    tracker.init_tip(start - 1).await?;
    // Another process may have seeded first; the stored value wins.
    let tip = tracker.get_tip().await?.unwrap_or(start - 1);
    info!(tip, next_sequence = tip + 1, "Bootstrapped live-tail checkpoint");
    Ok(tip)
}

/// Apply one fetched payload: parse, claim, write, complete, advance.
async fn apply_ready<G>(
    seq: u64,
    payload: &[u8],
    tracker: &SequenceTracker,
    gateway: &G,
    max_extent_degrees: f64,
) -> Result<Applied>
where
    G: ChangesetGateway,
{
    let events = match parse_diff(payload, max_extent_degrees) {
        Ok(events) => events,
        Err(e) => {
            warn!(sequence = seq, error = %e, "Diff payload unreadable");
            record_failure(tracker, seq, &e.to_string()).await?;
            return Ok(Applied::Failed);
        }
    };

    if !tracker.try_claim(seq).await? {
        return match tracker.status_of(seq).await? {
            Some(status) if status.is_applied() => {
                // A backfill worker got here first; just move the tip.
                debug!(sequence = seq, %status, "Sequence already applied, advancing tip");
                tracker.advance_tip(seq).await?;
                Ok(Applied::TipMoved)
            }
            status => {
                debug!(sequence = seq, ?status, "Claim unavailable");
                Ok(Applied::Busy)
            }
        };
    }

    let started = Instant::now();
    let applied = match gateway.upsert_batch(&events).await {
        Ok(applied) => applied,
        Err(e) => {
            warn!(sequence = seq, error = %e, "Batch write failed");
            tracker
                .complete(seq, SequenceStatus::Failed, Some(&e.to_string()))
                .await?;
            tracker.note_processed(seq).await?;
            return Ok(Applied::Failed);
        }
    };

    let status = if events.is_empty() {
        SequenceStatus::Empty
    } else {
        SequenceStatus::Success
    };
    tracker.complete(seq, status, None).await?;
    tracker.note_processed(seq).await?;

    let advanced = tracker.advance_tip(seq).await?;
    metrics::record_live_tail_applied(events.len(), started.elapsed());
    info!(
        sequence = seq,
        events = events.len(),
        applied,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Applied sequence"
    );

    if advanced {
        Ok(Applied::Advanced)
    } else {
        warn!(sequence = seq, "Tip did not advance, resyncing");
        Ok(Applied::TipMoved)
    }
}

/// Record a permanent failure for a sequence the loop could not apply.
///
/// `last_processed` still moves so a stuck tip shows up in health
/// checks as a growing gap.
async fn record_failure(tracker: &SequenceTracker, seq: u64, error: &str) -> Result<()> {
    if tracker.try_claim(seq).await? {
        tracker
            .complete(seq, SequenceStatus::Failed, Some(error))
            .await?;
    } else {
        debug!(sequence = seq, "Failure not recorded, sequence claimed elsewhere");
    }
    tracker.note_processed(seq).await?;
    Ok(())
}
