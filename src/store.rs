// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed changeset store.
//!
//! Holds the `changesets` table and implements the write contract:
//! one batch, one transaction, insert-or-update per id. Re-delivering
//! a payload converges to the same rows, which is what makes
//! at-least-once delivery safe everywhere upstream.
//!
//! # Merge Rules
//!
//! Replication replays history, so observations of one changeset can
//! arrive out of order across diffs. Three guards keep a stale
//! observation from clobbering a newer row:
//! - an `open` observation never overwrites a `closed` row
//! - an observation with a lower `comments_count` than the stored row
//!   is skipped
//! - a non-null `closed_at` is never replaced by null
//!
//! Everything else is last-observation-wins.
//!
//! # SQLite Busy Handling
//!
//! SQLite returns SQLITE_BUSY/SQLITE_LOCKED under contention (archive
//! workers, live-tail and backfill share one database file). Writes go
//! through [`execute_with_retry`]: exponential backoff, capped delay,
//! bounded attempts. Each retry re-runs the whole transaction.
//!
//! ## Why SQLite?
//!
//! - one file, zero operational surface, trivially snapshotted
//! - WAL mode lets the read-only query side run against the same file
//!   while a load is in progress
//! - the write rate (one batch at a time per worker) is well inside
//!   what a single WAL writer sustains

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info, warn};

use crate::diff::{ChangesetEvent, Comment};
use crate::error::{IngestError, Result};
use crate::gateway::{BoxFuture, ChangesetGateway};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

const UPSERT_SQL: &str = r#"
INSERT INTO changesets (
    id, username, uid, created_at, closed_at, open,
    num_changes, comments_count, tags, comments, geometry
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    username = excluded.username,
    uid = excluded.uid,
    created_at = excluded.created_at,
    closed_at = COALESCE(excluded.closed_at, changesets.closed_at),
    open = excluded.open,
    num_changes = excluded.num_changes,
    comments_count = excluded.comments_count,
    tags = excluded.tags,
    comments = excluded.comments,
    geometry = excluded.geometry
WHERE excluded.comments_count >= changesets.comments_count
  AND NOT (excluded.open = 1 AND changesets.open = 0)
"#;

/// A stored changeset row, read back for verification and operator
/// queries. Geometry comes back as the stored WKT text.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChangeset {
    pub id: i64,
    pub username: Option<String>,
    pub uid: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub open: bool,
    pub num_changes: u32,
    pub comments_count: u32,
    pub tags: BTreeMap<String, String>,
    pub comments: Vec<Comment>,
    pub geometry: Option<String>,
}

type ChangesetRow = (
    i64,                   // id
    Option<String>,        // username
    Option<i64>,           // uid
    DateTime<Utc>,         // created_at
    Option<DateTime<Utc>>, // closed_at
    bool,                  // open
    u32,                   // num_changes
    u32,                   // comments_count
    String,                // tags (JSON)
    String,                // comments (JSON)
    Option<String>,        // geometry (WKT)
);

/// Persistent changeset store backed by SQLite.
///
/// Cheap to share: the pool is internally reference counted, and the
/// sequence tracker runs on a clone of the same pool so every
/// cross-worker handshake lands in one database file.
pub struct SqliteStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening changeset store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| IngestError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        // SQLite serializes writers; a handful of connections is enough
        // to keep workers from queueing on pool acquire.
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS changesets (
                id INTEGER PRIMARY KEY,
                username TEXT,
                uid INTEGER,
                created_at TEXT NOT NULL,
                closed_at TEXT,
                open INTEGER NOT NULL,
                num_changes INTEGER NOT NULL,
                comments_count INTEGER NOT NULL,
                tags TEXT NOT NULL,
                comments TEXT NOT NULL,
                geometry TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_changesets_created_at ON changesets(created_at)",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            path: path_str,
        })
    }

    /// Connection pool, shared with the sequence tracker.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Apply a batch in one transaction. Returns the number of rows
    /// written; events stopped by a merge guard are not counted.
    pub async fn upsert_batch(&self, events: &[ChangesetEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        // Serialize once; retries re-run the transaction, not serde.
        let mut encoded = Vec::with_capacity(events.len());
        for event in events {
            let tags = serde_json::to_string(&event.tags)
                .map_err(|e| IngestError::Internal(format!("tags encoding: {e}")))?;
            let comments = serde_json::to_string(&event.comments)
                .map_err(|e| IngestError::Internal(format!("comments encoding: {e}")))?;
            let geometry = event.geometry.map(|g| g.to_wkt());
            encoded.push((tags, comments, geometry));
        }

        let pool = &self.pool;
        let applied = execute_with_retry("upsert_batch", || async {
            let mut tx = pool.begin().await?;
            let mut applied: usize = 0;
            for (event, (tags, comments, geometry)) in events.iter().zip(&encoded) {
                let result = sqlx::query(UPSERT_SQL)
                    .bind(event.id)
                    .bind(&event.username)
                    .bind(event.uid)
                    .bind(event.created_at)
                    .bind(event.closed_at)
                    .bind(event.open)
                    .bind(event.num_changes)
                    .bind(event.comments_count)
                    .bind(tags)
                    .bind(comments)
                    .bind(geometry)
                    .execute(&mut *tx)
                    .await?;
                applied += result.rows_affected() as usize;
            }
            tx.commit().await?;
            Ok(applied)
        })
        .await?;

        crate::metrics::record_batch_applied(applied);
        debug!(batch_len = events.len(), applied, "Applied changeset batch");
        Ok(applied)
    }

    /// Read one row back. `None` if the id was never stored.
    pub async fn get(&self, id: i64) -> Result<Option<StoredChangeset>> {
        let row: Option<ChangesetRow> = sqlx::query_as(
            r#"
            SELECT id, username, uid, created_at, closed_at, open,
                   num_changes, comments_count, tags, comments, geometry
            FROM changesets WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_row).transpose()
    }

    /// Total stored rows.
    pub async fn changeset_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM changesets")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Delete everything. Destructive; only the archive loader's
    /// truncate option calls this.
    pub async fn truncate_changesets(&self) -> Result<u64> {
        let pool = &self.pool;
        let result = execute_with_retry("truncate_changesets", || async {
            sqlx::query("DELETE FROM changesets").execute(pool).await
        })
        .await?;

        warn!(
            deleted = result.rows_affected(),
            "Truncated changesets table"
        );
        Ok(result.rows_affected())
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("store_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully, checkpointing the WAL.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Changeset store closed");
    }
}

fn decode_row(row: ChangesetRow) -> Result<StoredChangeset> {
    let (id, username, uid, created_at, closed_at, open, num_changes, comments_count, tags, comments, geometry) =
        row;
    let tags: BTreeMap<String, String> = serde_json::from_str(&tags)
        .map_err(|e| IngestError::Internal(format!("stored tags for {id} undecodable: {e}")))?;
    let comments: Vec<Comment> = serde_json::from_str(&comments)
        .map_err(|e| IngestError::Internal(format!("stored comments for {id} undecodable: {e}")))?;
    Ok(StoredChangeset {
        id,
        username,
        uid,
        created_at,
        closed_at,
        open,
        num_changes,
        comments_count,
        tags,
        comments,
        geometry,
    })
}

impl ChangesetGateway for SqliteStore {
    fn upsert_batch<'a>(&'a self, events: &'a [ChangesetEvent]) -> BoxFuture<'a, usize> {
        Box::pin(async move { SqliteStore::upsert_batch(self, events).await })
    }

    fn truncate_changesets(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move { SqliteStore::truncate_changesets(self).await })
    }

    fn changeset_count(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move { SqliteStore::changeset_count(self).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::Geometry;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 15, h, 0, 0).unwrap()
    }

    fn event(id: i64) -> ChangesetEvent {
        ChangesetEvent {
            id,
            username: Some("mapper".to_string()),
            uid: Some(42),
            created_at: ts(10),
            closed_at: None,
            open: true,
            num_changes: 3,
            comments_count: 0,
            tags: BTreeMap::from([("comment".to_string(), "initial".to_string())]),
            comments: Vec::new(),
            geometry: Some(Geometry::Point { lon: 1.0, lat: 2.0 }),
        }
    }

    fn closed_event(id: i64) -> ChangesetEvent {
        ChangesetEvent {
            closed_at: Some(ts(11)),
            open: false,
            num_changes: 5,
            comments_count: 1,
            comments: vec![Comment {
                uid: Some(7),
                username: Some("reviewer".to_string()),
                timestamp: Some(ts(12)),
                text: Some("looks good".to_string()),
            }],
            ..event(id)
        }
    }

    #[tokio::test]
    async fn test_open_creates_schema() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).await.unwrap();

        assert_eq!(store.changeset_count().await.unwrap(), 0);
        assert!(store.get(1).await.unwrap().is_none());

        store.close().await;
    }

    #[tokio::test]
    async fn test_upsert_batch_inserts() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).await.unwrap();

        let batch = vec![event(1), event(2), closed_event(3)];
        let applied = store.upsert_batch(&batch).await.unwrap();
        assert_eq!(applied, 3);
        assert_eq!(store.changeset_count().await.unwrap(), 3);

        let row = store.get(3).await.unwrap().unwrap();
        assert_eq!(row.id, 3);
        assert_eq!(row.username.as_deref(), Some("mapper"));
        assert!(!row.open);
        assert_eq!(row.closed_at, Some(ts(11)));
        assert_eq!(row.comments.len(), 1);
        assert_eq!(row.comments[0].text.as_deref(), Some("looks good"));
        assert_eq!(row.tags.get("comment").map(String::as_str), Some("initial"));
        assert_eq!(row.geometry.as_deref(), Some("POINT(1 2)"));

        store.close().await;
    }

    #[tokio::test]
    async fn test_upsert_batch_idempotent() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).await.unwrap();

        let batch = vec![event(1), event(2)];
        store.upsert_batch(&batch).await.unwrap();
        let before = store.get(1).await.unwrap().unwrap();

        // Re-delivery of the same payload must converge, not duplicate.
        store.upsert_batch(&batch).await.unwrap();
        assert_eq!(store.changeset_count().await.unwrap(), 2);
        assert_eq!(store.get(1).await.unwrap().unwrap(), before);

        store.close().await;
    }

    #[tokio::test]
    async fn test_later_observation_wins() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).await.unwrap();

        store.upsert_batch(&[event(1)]).await.unwrap();

        let mut updated = event(1);
        updated.num_changes = 20;
        updated.comments_count = 2;
        updated.tags.insert("source".to_string(), "survey".to_string());
        store.upsert_batch(&[updated]).await.unwrap();

        let row = store.get(1).await.unwrap().unwrap();
        assert_eq!(row.num_changes, 20);
        assert_eq!(row.comments_count, 2);
        assert_eq!(row.tags.len(), 2);
        assert_eq!(store.changeset_count().await.unwrap(), 1);

        store.close().await;
    }

    #[tokio::test]
    async fn test_open_never_overwrites_closed() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).await.unwrap();

        store.upsert_batch(&[closed_event(1)]).await.unwrap();

        // A stale open observation replayed out of order.
        let mut stale = event(1);
        stale.comments_count = 9;
        let applied = store.upsert_batch(&[stale]).await.unwrap();
        assert_eq!(applied, 0);

        let row = store.get(1).await.unwrap().unwrap();
        assert!(!row.open);
        assert_eq!(row.closed_at, Some(ts(11)));

        store.close().await;
    }

    #[tokio::test]
    async fn test_lower_comments_count_skipped() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).await.unwrap();

        let mut first = event(1);
        first.comments_count = 5;
        store.upsert_batch(&[first]).await.unwrap();

        let mut stale = event(1);
        stale.comments_count = 2;
        stale.num_changes = 99;
        let applied = store.upsert_batch(&[stale]).await.unwrap();
        assert_eq!(applied, 0);

        let row = store.get(1).await.unwrap().unwrap();
        assert_eq!(row.comments_count, 5);
        assert_eq!(row.num_changes, 3);

        store.close().await;
    }

    #[tokio::test]
    async fn test_closed_at_retained_over_null() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).await.unwrap();

        store.upsert_batch(&[closed_event(1)]).await.unwrap();

        // Closed observation that lost its closed_at along the way.
        let mut partial = closed_event(1);
        partial.closed_at = None;
        partial.comments_count = 4;
        let applied = store.upsert_batch(&[partial]).await.unwrap();
        assert_eq!(applied, 1);

        let row = store.get(1).await.unwrap().unwrap();
        assert_eq!(row.closed_at, Some(ts(11)));
        assert_eq!(row.comments_count, 4);

        store.close().await;
    }

    #[tokio::test]
    async fn test_mixed_batch_partially_applied() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).await.unwrap();

        store.upsert_batch(&[closed_event(1)]).await.unwrap();

        // One guarded event, one fresh insert, same batch.
        let batch = vec![event(1), event(2)];
        let applied = store.upsert_batch(&batch).await.unwrap();
        assert_eq!(applied, 1);
        assert_eq!(store.changeset_count().await.unwrap(), 2);

        store.close().await;
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).await.unwrap();

        assert_eq!(store.upsert_batch(&[]).await.unwrap(), 0);

        store.close().await;
    }

    #[tokio::test]
    async fn test_truncate() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).await.unwrap();

        store
            .upsert_batch(&[event(1), event(2), event(3)])
            .await
            .unwrap();
        let deleted = store.truncate_changesets().await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(store.changeset_count().await.unwrap(), 0);

        store.close().await;
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        {
            let store = SqliteStore::open(&db_path).await.unwrap();
            store.upsert_batch(&[closed_event(9)]).await.unwrap();
            store.close().await;
        }

        {
            let store = SqliteStore::open(&db_path).await.unwrap();
            assert_eq!(store.changeset_count().await.unwrap(), 1);
            let row = store.get(9).await.unwrap().unwrap();
            assert_eq!(row.closed_at, Some(ts(11)));
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_box_geometry_stored_as_polygon_wkt() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).await.unwrap();

        let mut boxed = event(1);
        boxed.geometry = Some(Geometry::from_bounds(0.0, 0.0, 1.0, 2.0));
        store.upsert_batch(&[boxed]).await.unwrap();

        let row = store.get(1).await.unwrap().unwrap();
        assert!(row.geometry.unwrap().starts_with("POLYGON(("));

        store.close().await;
    }

    #[tokio::test]
    async fn test_gateway_trait_delegates() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).await.unwrap();
        let gateway: &dyn ChangesetGateway = &store;

        let batch = vec![event(5)];
        assert_eq!(gateway.upsert_batch(&batch).await.unwrap(), 1);
        assert_eq!(gateway.changeset_count().await.unwrap(), 1);
        assert_eq!(gateway.truncate_changesets().await.unwrap(), 1);

        store.close().await;
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> =
            execute_with_retry("test_op", || {
                attempt_count += 1;
                async { Ok(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> =
            execute_with_retry("test_op", || {
                attempt_count += 1;
                async { Err(sqlx::Error::RowNotFound) }
            })
            .await;

        assert!(result.is_err());
        // Non-busy errors should not retry
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_row_not_found() {
        let error = sqlx::Error::RowNotFound;
        assert!(!is_sqlite_busy_error(&error));
    }

    #[test]
    fn test_is_sqlite_busy_error_pool_timed_out() {
        let error = sqlx::Error::PoolTimedOut;
        assert!(!is_sqlite_busy_error(&error));
    }
}
