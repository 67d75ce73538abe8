//! Archive loader: one-shot bulk bootstrap from a changeset dump.
//!
//! Streams a planet-scale dump through the diff parser and fans fixed-size
//! batches out to a worker pool writing through the gateway.
//!
//! # Pipeline
//!
//! ```text
//! dump file ──▶ blocking reader ──▶ bounded queue ──▶ worker pool ──▶ gateway
//!               (parse, date and    (depth N,          (upsert_batch
//!                bbox filters)       backpressure)      with retry)
//! ```
//!
//! # Failure Handling
//!
//! Malformed elements are skipped and counted inside the parser. A failed
//! batch write is retried with exponential backoff; when the attempt budget
//! is exhausted the whole run aborts: the failing worker returns, the pool
//! shuts down, the queue closes and the reader stops at its next send.
//! Success requires a full drain of both the dump and the queue.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ArchiveConfig;
use crate::diff::{sniff_reader, ChangesetEvent, ChangesetReader};
use crate::error::{IngestError, Result};
use crate::gateway::ChangesetGateway;
use crate::metrics;
use crate::resilience::RetryConfig;

/// Log reader progress every this many parsed events.
const PROGRESS_EVERY: u64 = 1_000_000;

/// Outcome of a completed archive run.
#[derive(Debug, Default, Clone)]
pub struct ArchiveStats {
    /// Events the parser produced.
    pub events_parsed: u64,
    /// Malformed elements skipped by the parser.
    pub skipped_malformed: u64,
    /// Events outside the configured date bounds.
    pub filtered_by_date: u64,
    /// Events whose bounding box exceeded the extent limit.
    pub filtered_by_bbox: u64,
    /// Batches written through the gateway.
    pub batches_applied: u64,
    /// Rows the gateway reported applied.
    pub rows_applied: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct ReadTally {
    events_parsed: u64,
    skipped_malformed: u64,
    filtered_by_date: u64,
    filtered_by_bbox: u64,
}

#[derive(Debug, Default)]
struct WorkerTally {
    batches_applied: u64,
    rows_applied: u64,
}

/// Load a dump file from disk.
///
/// Opens `path` with the configured read buffer, sniffs the compression
/// format and runs the full pipeline. Destructive when `config.truncate`
/// is set.
pub async fn load_archive<G>(
    path: &Path,
    config: &ArchiveConfig,
    max_extent_degrees: f64,
    gateway: Arc<G>,
) -> Result<ArchiveStats>
where
    G: ChangesetGateway,
{
    let file = std::fs::File::open(path).map_err(|e| {
        IngestError::Config(format!("cannot open archive {}: {e}", path.display()))
    })?;
    let reader = BufReader::with_capacity(config.read_buffer_size, file);
    info!(path = %path.display(), "Loading changeset archive");
    load_from_reader(reader, config, max_extent_degrees, gateway).await
}

/// Run the pipeline over any buffered source.
///
/// One blocking reader parses and filters; `worker_count` tasks drain a
/// queue of depth `queue_depth`, so at most `queue_depth + worker_count`
/// batches are in flight at once.
pub async fn load_from_reader<R, G>(
    source: R,
    config: &ArchiveConfig,
    max_extent_degrees: f64,
    gateway: Arc<G>,
) -> Result<ArchiveStats>
where
    R: BufRead + Send + 'static,
    G: ChangesetGateway,
{
    let started = Instant::now();
    let bounds = config.date_bounds()?;

    if config.truncate {
        let removed = gateway.truncate_changesets().await?;
        warn!(removed, "Truncated changesets table before load");
    }

    let (tx, rx) = mpsc::channel::<Vec<ChangesetEvent>>(config.queue_depth);
    let queue = Arc::new(Mutex::new(rx));

    let batch_size = config.batch_size;
    let reader_task = tokio::task::spawn_blocking(move || {
        read_archive(source, bounds, max_extent_degrees, batch_size, tx)
    });

    let retry = RetryConfig {
        max_attempts: config.max_write_attempts,
        ..RetryConfig::startup()
    };

    let mut workers: JoinSet<Result<WorkerTally>> = JoinSet::new();
    for worker in 0..config.worker_count {
        workers.spawn(apply_batches(
            worker,
            Arc::clone(&queue),
            Arc::clone(&gateway),
            retry.clone(),
        ));
    }
    drop(queue);

    let mut tally = WorkerTally::default();
    let mut failure: Option<IngestError> = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(worker_tally)) => {
                tally.batches_applied += worker_tally.batches_applied;
                tally.rows_applied += worker_tally.rows_applied;
            }
            Ok(Err(e)) => {
                failure = Some(e);
                // Dropping the pool drops the queue receiver, which stops
                // the reader at its next send.
                workers.shutdown().await;
                break;
            }
            Err(e) => {
                failure = Some(IngestError::Internal(format!(
                    "archive worker panicked: {e}"
                )));
                workers.shutdown().await;
                break;
            }
        }
    }

    let read_result = reader_task
        .await
        .map_err(|e| IngestError::Internal(format!("archive reader panicked: {e}")))?;

    if let Some(e) = failure {
        let read = read_result.unwrap_or_default();
        error!(
            events_parsed = read.events_parsed,
            batches_applied = tally.batches_applied,
            rows_applied = tally.rows_applied,
            error = %e,
            "Archive load aborted"
        );
        return Err(e);
    }

    let read = read_result?;
    let stats = ArchiveStats {
        events_parsed: read.events_parsed,
        skipped_malformed: read.skipped_malformed,
        filtered_by_date: read.filtered_by_date,
        filtered_by_bbox: read.filtered_by_bbox,
        batches_applied: tally.batches_applied,
        rows_applied: tally.rows_applied,
        elapsed: started.elapsed(),
    };

    metrics::record_archive_complete(stats.events_parsed, stats.rows_applied, stats.elapsed);
    info!(
        events_parsed = stats.events_parsed,
        skipped_malformed = stats.skipped_malformed,
        filtered_by_date = stats.filtered_by_date,
        filtered_by_bbox = stats.filtered_by_bbox,
        batches_applied = stats.batches_applied,
        rows_applied = stats.rows_applied,
        elapsed_secs = stats.elapsed.as_secs(),
        "Archive load complete"
    );

    Ok(stats)
}

/// Blocking side of the pipeline: decode, parse, filter, batch.
///
/// Runs on a blocking thread; `blocking_send` provides the backpressure.
/// A closed queue means the pool is gone, and the abort reason is
/// reported from the worker side.
fn read_archive<R>(
    source: R,
    bounds: (Option<NaiveDate>, Option<NaiveDate>),
    max_extent_degrees: f64,
    batch_size: usize,
    tx: mpsc::Sender<Vec<ChangesetEvent>>,
) -> Result<ReadTally>
where
    R: BufRead + Send + 'static,
{
    let (from, to) = bounds;
    let decoded = sniff_reader(source)?;
    let mut reader = ChangesetReader::new(decoded);

    let mut tally = ReadTally::default();
    let mut batch: Vec<ChangesetEvent> = Vec::with_capacity(batch_size);

    while let Some(event) = reader.next_event()? {
        tally.events_parsed += 1;
        if tally.events_parsed % PROGRESS_EVERY == 0 {
            info!(
                events_parsed = tally.events_parsed,
                skipped_malformed = reader.skipped(),
                "Archive read progress"
            );
        }

        let day = event.created_at.date_naive();
        if from.is_some_and(|f| day < f) || to.is_some_and(|t| day > t) {
            tally.filtered_by_date += 1;
            continue;
        }
        if event
            .geometry
            .as_ref()
            .is_some_and(|g| g.exceeds_extent(max_extent_degrees))
        {
            tally.filtered_by_bbox += 1;
            metrics::record_events_dropped_oversized(1);
            continue;
        }

        batch.push(event);
        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if tx.blocking_send(full).is_err() {
                debug!("Batch queue closed, stopping archive read");
                tally.skipped_malformed = reader.skipped();
                return Ok(tally);
            }
        }
    }

    if !batch.is_empty() && tx.blocking_send(batch).is_err() {
        debug!("Batch queue closed before final batch");
    }

    tally.skipped_malformed = reader.skipped();
    Ok(tally)
}

/// Worker loop: drain the shared queue, writing each batch with retry.
async fn apply_batches<G>(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<Vec<ChangesetEvent>>>>,
    gateway: Arc<G>,
    retry: RetryConfig,
) -> Result<WorkerTally>
where
    G: ChangesetGateway,
{
    let mut tally = WorkerTally::default();
    loop {
        let batch = queue.lock().await.recv().await;
        let Some(batch) = batch else { break };

        let applied = write_with_retry(worker, &batch, gateway.as_ref(), &retry).await?;
        tally.batches_applied += 1;
        tally.rows_applied += applied as u64;
        debug!(worker, batch_len = batch.len(), applied, "Applied archive batch");
    }
    debug!(worker, batches = tally.batches_applied, "Archive worker drained");
    Ok(tally)
}

/// Write one batch, retrying up to the configured attempt budget.
async fn write_with_retry<G>(
    worker: usize,
    batch: &[ChangesetEvent],
    gateway: &G,
    retry: &RetryConfig,
) -> Result<usize>
where
    G: ChangesetGateway,
{
    let mut attempt = 0usize;
    loop {
        match gateway.upsert_batch(batch).await {
            Ok(applied) => return Ok(applied),
            Err(e) if attempt + 1 < retry.max_attempts => {
                attempt += 1;
                let delay = retry.delay_for_attempt(attempt);
                metrics::record_archive_write_retry();
                warn!(
                    worker,
                    attempt,
                    max_attempts = retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Batch write failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(
                    worker,
                    attempts = attempt + 1,
                    batch_len = batch.len(),
                    error = %e,
                    "Batch write failed permanently, aborting load"
                );
                return Err(e);
            }
        }
    }
}
