//! Recording gateway with injectable write failures.
//!
//! Stands in for the SQLite store wherever a coordinator or loader is
//! generic over the gateway trait. Records every applied batch and can
//! fail the next N writes, fail forever, or slow every write down to
//! exercise backpressure.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use changeset_sync::gateway::{BoxFuture, ChangesetGateway};
use changeset_sync::{ChangesetEvent, IngestError};

/// Gateway that records batches instead of persisting them.
pub struct TrackingGateway {
    batches: RwLock<Vec<Vec<i64>>>,
    rows_applied: AtomicUsize,
    truncate_calls: AtomicUsize,
    fail_next: AtomicUsize,
    fail_all: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
}

impl TrackingGateway {
    pub fn new() -> Self {
        Self {
            batches: RwLock::new(Vec::new()),
            rows_applied: AtomicUsize::new(0),
            truncate_calls: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            fail_all: AtomicBool::new(false),
            write_delay: Mutex::new(None),
        }
    }

    /// Fail the next `n` upserts with an injected write error, then
    /// recover.
    pub fn fail_times(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every upsert from now on.
    pub fn fail_always(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    /// Sleep this long inside every upsert. Makes the writer the
    /// bottleneck so bounded queues actually fill.
    #[allow(dead_code)]
    pub fn with_write_delay(self, delay: Duration) -> Self {
        *self.write_delay.lock().unwrap() = Some(delay);
        self
    }

    /// Ids of every applied batch, in apply order.
    pub fn batches(&self) -> Vec<Vec<i64>> {
        self.batches.read().unwrap().clone()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.read().unwrap().len()
    }

    /// All applied ids flattened, in apply order.
    #[allow(dead_code)]
    pub fn applied_ids(&self) -> Vec<i64> {
        self.batches.read().unwrap().iter().flatten().copied().collect()
    }

    pub fn total_rows(&self) -> usize {
        self.rows_applied.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn truncate_calls(&self) -> usize {
        self.truncate_calls.load(Ordering::SeqCst)
    }
}

impl Default for TrackingGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangesetGateway for TrackingGateway {
    fn upsert_batch<'a>(&'a self, events: &'a [ChangesetEvent]) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let delay = *self.write_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if self.fail_all.load(Ordering::SeqCst) {
                return Err(IngestError::Internal("injected write failure".to_string()));
            }
            let next_failed = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if next_failed {
                return Err(IngestError::Internal("injected write failure".to_string()));
            }

            self.batches
                .write()
                .unwrap()
                .push(events.iter().map(|e| e.id).collect());
            self.rows_applied.fetch_add(events.len(), Ordering::SeqCst);
            Ok(events.len())
        })
    }

    fn truncate_changesets(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            self.truncate_calls.fetch_add(1, Ordering::SeqCst);
            let mut batches = self.batches.write().unwrap();
            let dropped: usize = batches.iter().map(Vec::len).sum();
            batches.clear();
            self.rows_applied.store(0, Ordering::SeqCst);
            Ok(dropped as u64)
        })
    }

    fn changeset_count(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            let count: usize = self.batches.read().unwrap().iter().map(Vec::len).sum();
            Ok(count as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn event(id: i64) -> ChangesetEvent {
        ChangesetEvent {
            id,
            username: None,
            uid: None,
            created_at: Utc::now(),
            closed_at: None,
            open: true,
            num_changes: 1,
            comments_count: 0,
            tags: BTreeMap::new(),
            comments: Vec::new(),
            geometry: None,
        }
    }

    #[tokio::test]
    async fn test_gateway_records_batches() {
        let gateway = TrackingGateway::new();

        gateway.upsert_batch(&[event(1), event(2)]).await.unwrap();
        gateway.upsert_batch(&[event(3)]).await.unwrap();

        assert_eq!(gateway.batch_count(), 2);
        assert_eq!(gateway.batches(), vec![vec![1, 2], vec![3]]);
        assert_eq!(gateway.total_rows(), 3);
        assert_eq!(gateway.changeset_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_gateway_fail_times_then_recovers() {
        let gateway = TrackingGateway::new();
        gateway.fail_times(2);

        assert!(gateway.upsert_batch(&[event(1)]).await.is_err());
        assert!(gateway.upsert_batch(&[event(1)]).await.is_err());
        assert!(gateway.upsert_batch(&[event(1)]).await.is_ok());
        assert_eq!(gateway.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_gateway_fail_always() {
        let gateway = TrackingGateway::new();
        gateway.fail_always();

        for _ in 0..5 {
            assert!(gateway.upsert_batch(&[event(1)]).await.is_err());
        }
        assert_eq!(gateway.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_gateway_truncate_clears_recording() {
        let gateway = TrackingGateway::new();
        gateway.upsert_batch(&[event(1), event(2)]).await.unwrap();

        let dropped = gateway.truncate_changesets().await.unwrap();

        assert_eq!(dropped, 2);
        assert_eq!(gateway.truncate_calls(), 1);
        assert_eq!(gateway.changeset_count().await.unwrap(), 0);
    }
}
