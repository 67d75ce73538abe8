// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable sequence tracking.
//!
//! Records what happened to every replication sequence and owns the
//! contiguous tip checkpoint. All cross-worker coordination goes
//! through these two tables; there is no in-process shared state, so
//! backfill and live-tail stay correct even run as separate processes
//! against the same database file.
//!
//! # Claim Protocol
//!
//! `try_claim` is the only mutual-exclusion primitive: an atomic
//! `pending -> processing` transition that exactly one caller wins.
//! Workers never coordinate any other way.
//!
//! ```text
//! try_claim(s) → fetch → parse → upsert → complete(s, ...) [→ advance_tip(s)]
//!               (crash here = row stays `processing`;
//!                release_stale() reverts it to `pending` on restart)
//! ```
//!
//! # Tip Semantics
//!
//! The checkpoint stores the highest sequence through which history is
//! contiguously applied. `advance_tip(s)` is a compare-and-set that
//! succeeds only when `s == tip + 1`, so the tip can never jump a gap
//! no matter how calls interleave. Restart resumes from `tip + 1`.

use std::collections::HashMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::store::execute_with_retry;

/// Lifecycle state of one replication sequence.
///
/// ```text
/// (absent) → pending → processing → success | empty | backfilled | failed
///               ↑                                                    │
///               └────────────── reopen_failed ──────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Known but not yet claimed.
    Pending,
    /// Claimed by a worker; in flight.
    Processing,
    /// Applied by the live-tail loop.
    Success,
    /// Fetch or apply failed permanently; error recorded.
    Failed,
    /// Fetched and parsed to zero applicable events.
    Empty,
    /// Applied by a backfill worker.
    Backfilled,
}

impl SequenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceStatus::Pending => "pending",
            SequenceStatus::Processing => "processing",
            SequenceStatus::Success => "success",
            SequenceStatus::Failed => "failed",
            SequenceStatus::Empty => "empty",
            SequenceStatus::Backfilled => "backfilled",
        }
    }

    /// No further work will happen without operator intervention.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SequenceStatus::Pending | SequenceStatus::Processing)
    }

    /// The sequence's data is fully applied (or there was none).
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            SequenceStatus::Success | SequenceStatus::Empty | SequenceStatus::Backfilled
        )
    }
}

impl fmt::Display for SequenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SequenceStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SequenceStatus::Pending),
            "processing" => Ok(SequenceStatus::Processing),
            "success" => Ok(SequenceStatus::Success),
            "failed" => Ok(SequenceStatus::Failed),
            "empty" => Ok(SequenceStatus::Empty),
            "backfilled" => Ok(SequenceStatus::Backfilled),
            other => Err(IngestError::Internal(format!(
                "unknown sequence status {other:?} in tracker table"
            ))),
        }
    }
}

/// One row of the sequences table.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceRecord {
    pub sequence_number: u64,
    pub status: SequenceStatus,
    pub ingested_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// The tip checkpoint row.
///
/// `current_tip` only moves contiguously; `last_processed` also counts
/// sequences the live-tail finished without advancing the tip (failed
/// ones), which makes a stuck tip visible in health output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointState {
    pub current_tip: u64,
    pub last_processed: u64,
    pub updated_at: DateTime<Utc>,
}

/// Durable per-sequence status plus the contiguous tip, in SQLite.
///
/// Shares the store's connection pool so claims and writes land in the
/// same database file.
#[derive(Clone)]
pub struct SequenceTracker {
    pool: SqlitePool,
}

impl SequenceTracker {
    /// Build on an existing pool, creating the tables if needed.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sequences (
                sequence_number INTEGER PRIMARY KEY,
                status TEXT NOT NULL,
                ingested_at TEXT NOT NULL,
                error_message TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoint (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                current_tip INTEGER NOT NULL,
                last_processed INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sequences_status ON sequences(status)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    // =========================================================================
    // Claims
    // =========================================================================

    /// Atomically claim a sequence for processing.
    ///
    /// Creates the row `pending` if absent, then flips `pending ->
    /// processing`. Returns `false` when another worker holds the claim
    /// or the sequence is already terminal. Exactly one concurrent
    /// caller wins.
    pub async fn try_claim(&self, seq: u64) -> Result<bool> {
        let pool = &self.pool;
        let now = Utc::now();

        let claimed = execute_with_retry("try_claim", || async {
            sqlx::query(
                "INSERT OR IGNORE INTO sequences (sequence_number, status, ingested_at)
                 VALUES (?, 'pending', ?)",
            )
            .bind(seq as i64)
            .bind(now)
            .execute(pool)
            .await?;

            let result = sqlx::query(
                "UPDATE sequences SET status = 'processing', ingested_at = ?
                 WHERE sequence_number = ? AND status = 'pending'",
            )
            .bind(now)
            .bind(seq as i64)
            .execute(pool)
            .await?;

            Ok(result.rows_affected() == 1)
        })
        .await?;

        debug!(seq, claimed, "Claim attempt");
        Ok(claimed)
    }

    /// Record the outcome of a claimed sequence.
    pub async fn complete(
        &self,
        seq: u64,
        status: SequenceStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let pool = &self.pool;
        let now = Utc::now();

        let result = execute_with_retry("complete", || async {
            sqlx::query(
                "UPDATE sequences SET status = ?, ingested_at = ?, error_message = ?
                 WHERE sequence_number = ?",
            )
            .bind(status.as_str())
            .bind(now)
            .bind(error)
            .bind(seq as i64)
            .execute(pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::InvalidState {
                expected: format!("sequence {seq} row to complete"),
                actual: "no such row".to_string(),
            });
        }

        crate::metrics::record_sequence_completed(status.as_str());
        if status == SequenceStatus::Failed {
            warn!(seq, error = error.unwrap_or("<none>"), "Sequence failed");
        } else {
            debug!(seq, status = %status, "Sequence completed");
        }
        Ok(())
    }

    /// Revert `processing` rows older than `stale_after` to `pending`.
    ///
    /// Startup recovery for claims orphaned by a crash. The age gate
    /// keeps a live worker's in-flight claim from being stolen.
    pub async fn release_stale(&self, stale_after: Duration) -> Result<u64> {
        let pool = &self.pool;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());

        let result = execute_with_retry("release_stale", || async {
            sqlx::query(
                "UPDATE sequences SET status = 'pending'
                 WHERE status = 'processing' AND ingested_at < ?",
            )
            .bind(cutoff)
            .execute(pool)
            .await
        })
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            info!(released, "Released stale processing claims");
        }
        Ok(released)
    }

    /// Put a failed sequence back in play (`failed -> pending`).
    ///
    /// Used by the live-tail halt policy and operator reprocessing.
    /// Returns `false` when the sequence is not in `failed`.
    pub async fn reopen_failed(&self, seq: u64) -> Result<bool> {
        let pool = &self.pool;
        let now = Utc::now();

        let result = execute_with_retry("reopen_failed", || async {
            sqlx::query(
                "UPDATE sequences SET status = 'pending', ingested_at = ?, error_message = NULL
                 WHERE sequence_number = ? AND status = 'failed'",
            )
            .bind(now)
            .bind(seq as i64)
            .execute(pool)
            .await
        })
        .await?;

        let reopened = result.rows_affected() == 1;
        if reopened {
            info!(seq, "Reopened failed sequence");
        }
        Ok(reopened)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn status_of(&self, seq: u64) -> Result<Option<SequenceStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM sequences WHERE sequence_number = ?")
                .bind(seq as i64)
                .fetch_optional(&self.pool)
                .await?;

        status.as_deref().map(SequenceStatus::from_str).transpose()
    }

    /// Full row, including the recorded error, for operator queries.
    pub async fn record_of(&self, seq: u64) -> Result<Option<SequenceRecord>> {
        let row: Option<(i64, String, DateTime<Utc>, Option<String>)> = sqlx::query_as(
            "SELECT sequence_number, status, ingested_at, error_message
             FROM sequences WHERE sequence_number = ?",
        )
        .bind(seq as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(sequence_number, status, ingested_at, error_message)| {
            Ok(SequenceRecord {
                sequence_number: sequence_number as u64,
                status: status.parse()?,
                ingested_at,
                error_message,
            })
        })
        .transpose()
    }

    /// Statuses of every tracked sequence in the range (inclusive).
    /// Sequences with no row are simply absent from the map.
    pub async fn statuses_in(
        &self,
        range: RangeInclusive<u64>,
    ) -> Result<HashMap<u64, SequenceStatus>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT sequence_number, status FROM sequences
             WHERE sequence_number BETWEEN ? AND ?",
        )
        .bind(*range.start() as i64)
        .bind(*range.end() as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for (seq, status) in rows {
            map.insert(seq as u64, status.parse()?);
        }
        Ok(map)
    }

    /// Row counts grouped by status, for health output.
    pub async fn counts_by_status(&self) -> Result<HashMap<SequenceStatus, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sequences GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for (status, count) in rows {
            map.insert(status.parse()?, count as u64);
        }
        Ok(map)
    }

    // =========================================================================
    // Checkpoint
    // =========================================================================

    /// Current checkpoint, `None` before the first `init_tip`.
    pub async fn get_checkpoint(&self) -> Result<Option<CheckpointState>> {
        let row: Option<(i64, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT current_tip, last_processed, updated_at FROM checkpoint WHERE id = 0",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(current_tip, last_processed, updated_at)| CheckpointState {
            current_tip: current_tip as u64,
            last_processed: last_processed as u64,
            updated_at,
        }))
    }

    /// Contiguous tip, `None` before the first `init_tip`.
    pub async fn get_tip(&self) -> Result<Option<u64>> {
        Ok(self.get_checkpoint().await?.map(|c| c.current_tip))
    }

    /// Seed the checkpoint. A no-op (returning `false`) once one exists,
    /// so a configured start override never rewinds a live deployment.
    pub async fn init_tip(&self, tip: u64) -> Result<bool> {
        let pool = &self.pool;
        let now = Utc::now();

        let result = execute_with_retry("init_tip", || async {
            sqlx::query(
                "INSERT OR IGNORE INTO checkpoint (id, current_tip, last_processed, updated_at)
                 VALUES (0, ?, ?, ?)",
            )
            .bind(tip as i64)
            .bind(tip as i64)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        let initialized = result.rows_affected() == 1;
        if initialized {
            info!(tip, "Initialized checkpoint");
        }
        Ok(initialized)
    }

    /// Advance the tip to `seq`, only if `seq == tip + 1`.
    ///
    /// Compare-and-set; `false` means the tip was somewhere else and
    /// nothing changed.
    pub async fn advance_tip(&self, seq: u64) -> Result<bool> {
        if seq == 0 {
            return Ok(false);
        }
        let pool = &self.pool;
        let now = Utc::now();

        let result = execute_with_retry("advance_tip", || async {
            sqlx::query(
                "UPDATE checkpoint
                 SET current_tip = ?, last_processed = ?, updated_at = ?
                 WHERE id = 0 AND current_tip = ?",
            )
            .bind(seq as i64)
            .bind(seq as i64)
            .bind(now)
            .bind((seq - 1) as i64)
            .execute(pool)
            .await
        })
        .await?;

        let advanced = result.rows_affected() == 1;
        if advanced {
            crate::metrics::record_tip(seq);
            debug!(tip = seq, "Advanced tip");
        }
        Ok(advanced)
    }

    /// Bump `last_processed` without moving the tip. Live-tail calls
    /// this for sequences it finished but could not advance past
    /// (failed ones), so the gap is visible in the checkpoint.
    pub async fn note_processed(&self, seq: u64) -> Result<()> {
        let pool = &self.pool;
        let now = Utc::now();

        execute_with_retry("note_processed", || async {
            sqlx::query(
                "UPDATE checkpoint SET last_processed = MAX(last_processed, ?), updated_at = ?
                 WHERE id = 0",
            )
            .bind(seq as i64)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }
}
