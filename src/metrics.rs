//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Diff fetching and outcomes
//! - Parsing and filtering
//! - Store writes and retries
//! - Sequence tracking and tip progress
//! - Archive, live-tail and backfill throughput
//! - Engine state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `ingest_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use changeset_sync::metrics;
//! use std::time::Duration;
//!
//! // In the live-tail loop after applying a sequence
//! metrics::record_live_tail_applied(42, Duration::from_millis(80));
//!
//! // After the tip moves
//! metrics::record_tip(5_432_109);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Parsing
// =============================================================================

/// Record a malformed element skipped by the diff or archive reader.
pub fn record_element_skipped() {
    counter!("ingest_elements_skipped_total").increment(1);
}

/// Record events dropped for an oversized bounding box.
pub fn record_events_dropped_oversized(count: usize) {
    counter!("ingest_events_dropped_oversized_total").increment(count as u64);
}

// =============================================================================
// Store
// =============================================================================

/// Record a SQLite retry (SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_store_retry(operation: &str) {
    counter!("ingest_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record an applied changeset batch.
pub fn record_batch_applied(applied: usize) {
    counter!("ingest_rows_applied_total").increment(applied as u64);
    histogram!("ingest_batch_size").record(applied as f64);
}

// =============================================================================
// Sequence tracking
// =============================================================================

/// Record a sequence reaching a terminal status.
pub fn record_sequence_completed(status: &str) {
    counter!("ingest_sequences_completed_total", "status" => status.to_string()).increment(1);
}

/// Gauge for the contiguous tip.
pub fn record_tip(tip: u64) {
    gauge!("ingest_tip_sequence").set(tip as f64);
}

/// Gauge for how far the tip trails the remote head.
pub fn record_backlog(backlog: u64) {
    gauge!("ingest_backlog_sequences").set(backlog as f64);
}

// =============================================================================
// Fetching
// =============================================================================

/// Record a fetch outcome by label (ready, not_yet_published, ...).
pub fn record_fetch_outcome(outcome: &str) {
    counter!("ingest_fetch_outcomes_total", "outcome" => outcome.to_string()).increment(1);
}

// =============================================================================
// Archive loading
// =============================================================================

/// Record a retried archive batch write.
pub fn record_archive_write_retry() {
    counter!("ingest_archive_write_retries_total").increment(1);
}

/// Record a finished archive load.
pub fn record_archive_complete(events_parsed: u64, rows_applied: u64, elapsed: Duration) {
    counter!("ingest_archive_events_total").increment(events_parsed);
    counter!("ingest_archive_rows_total").increment(rows_applied);
    histogram!("ingest_archive_duration_seconds").record(elapsed.as_secs_f64());
}

// =============================================================================
// Coordinators
// =============================================================================

/// Record a sequence applied by the live-tail loop.
pub fn record_live_tail_applied(events: usize, elapsed: Duration) {
    counter!("ingest_live_tail_sequences_total").increment(1);
    counter!("ingest_live_tail_events_total").increment(events as u64);
    histogram!("ingest_live_tail_apply_duration_seconds").record(elapsed.as_secs_f64());
}

/// Record how many sequences a backfill pass queued.
pub fn record_backfill_planned(planned: u64) {
    counter!("ingest_backfill_planned_total").increment(planned);
}

/// Record a sequence applied by a backfill worker.
pub fn record_backfill_applied(events: usize, elapsed: Duration) {
    counter!("ingest_backfill_sequences_total").increment(1);
    counter!("ingest_backfill_events_total").increment(events as u64);
    histogram!("ingest_backfill_apply_duration_seconds").record(elapsed.as_secs_f64());
}

// =============================================================================
// Engine
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encode state as numeric for alerting (0=created, 2=running, ...)
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("ingest_engine_state").set(value);
}
