// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store integration trait.
//!
//! Defines the write contract the ingestion pipeline needs from the
//! persistent changeset store: an atomic, idempotent batch upsert plus
//! the handful of maintenance calls the loaders use. Coordinators and
//! the archive loader are generic over this trait, so tests drive them
//! with in-memory fakes and production wires in [`crate::store::SqliteStore`].
//!
//! # Example
//!
//! ```rust
//! use changeset_sync::gateway::{BoxFuture, ChangesetGateway};
//! use changeset_sync::diff::ChangesetEvent;
//!
//! struct DiscardStore;
//!
//! impl ChangesetGateway for DiscardStore {
//!     fn upsert_batch<'a>(&'a self, events: &'a [ChangesetEvent]) -> BoxFuture<'a, usize> {
//!         Box::pin(async move { Ok(events.len()) })
//!     }
//!
//!     fn truncate_changesets(&self) -> BoxFuture<'_, u64> {
//!         Box::pin(async move { Ok(0) })
//!     }
//!
//!     fn changeset_count(&self) -> BoxFuture<'_, u64> {
//!         Box::pin(async move { Ok(0) })
//!     }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

use crate::diff::ChangesetEvent;
use crate::error::Result;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Write contract to the changeset store.
///
/// Callers rely on three guarantees:
/// 1. A batch is visible atomically (all rows or none).
/// 2. Re-applying the same batch is a no-op (idempotence under
///    at-least-once delivery).
/// 3. When the same id appears in multiple observations, the later
///    observation wins, subject to the store's merge guards.
pub trait ChangesetGateway: Send + Sync + 'static {
    /// Insert-or-update every event in one atomic batch.
    ///
    /// Returns the number of rows actually written; events rejected by
    /// a merge guard are counted out. The slice is borrowed so a
    /// failed batch can be retried without cloning.
    fn upsert_batch<'a>(&'a self, events: &'a [ChangesetEvent]) -> BoxFuture<'a, usize>;

    /// Delete every stored changeset row. Destructive; used by the
    /// archive loader's truncate option before a full reload.
    fn truncate_changesets(&self) -> BoxFuture<'_, u64>;

    /// Total stored changeset rows, for health checks and load stats.
    fn changeset_count(&self) -> BoxFuture<'_, u64>;
}

/// A no-op implementation for dry runs and standalone testing.
///
/// Logs what it would write and stores nothing.
#[derive(Clone)]
pub struct NoOpGateway;

impl ChangesetGateway for NoOpGateway {
    fn upsert_batch<'a>(&'a self, events: &'a [ChangesetEvent]) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            tracing::debug!(
                batch_len = events.len(),
                first_id = events.first().map(|e| e.id).unwrap_or_default(),
                "NoOp: would upsert batch"
            );
            Ok(events.len())
        })
    }

    fn truncate_changesets(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            tracing::debug!("NoOp: would truncate changesets");
            Ok(0)
        })
    }

    fn changeset_count(&self) -> BoxFuture<'_, u64> {
        Box::pin(async { Ok(0) })
    }
}
