//! Scripted diff feed standing in for the upstream replication server.
//!
//! Each sequence carries a script of outcomes consumed in order by
//! successive fetches, with the last entry repeating. Unscripted
//! sequences report not-yet-published, which is what a real server
//! says past its tip.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use changeset_sync::gateway::BoxFuture;
use changeset_sync::{DiffSource, FetchOutcome};

/// Scripted diff source for driving the coordinators without a server.
///
/// Construction-time scripting goes through the consuming builders
/// (`ready`, `unpublished`, `transient`, `failed`); `publish` and
/// `set_remote` mutate a shared feed while a coordinator is running.
pub struct ScriptedFeed {
    remote: AtomicU64,
    scripts: Mutex<HashMap<u64, VecDeque<FetchOutcome>>>,
    fetch_log: Mutex<Vec<(u64, Instant)>>,
}

impl ScriptedFeed {
    pub fn new(remote: u64) -> Self {
        Self {
            remote: AtomicU64::new(remote),
            scripts: Mutex::new(HashMap::new()),
            fetch_log: Mutex::new(Vec::new()),
        }
    }

    /// Append a Ready outcome with the given payload to `seq`'s script.
    pub fn ready(self, seq: u64, payload: &[u8]) -> Self {
        self.push(seq, FetchOutcome::Ready(payload.to_vec()));
        self
    }

    /// Append `times` NotYetPublished outcomes to `seq`'s script.
    pub fn unpublished(self, seq: u64, times: usize) -> Self {
        for _ in 0..times {
            self.push(seq, FetchOutcome::NotYetPublished);
        }
        self
    }

    /// Append a Transient failure to `seq`'s script.
    #[allow(dead_code)]
    pub fn transient(self, seq: u64, error: &str) -> Self {
        self.push(seq, FetchOutcome::Transient(error.to_string()));
        self
    }

    /// Append a permanent failure to `seq`'s script.
    #[allow(dead_code)]
    pub fn failed(self, seq: u64, error: &str) -> Self {
        self.push(seq, FetchOutcome::Failed(error.to_string()));
        self
    }

    fn push(&self, seq: u64, outcome: FetchOutcome) {
        self.scripts
            .lock()
            .unwrap()
            .entry(seq)
            .or_default()
            .push_back(outcome);
    }

    /// Replace `seq`'s script with a single Ready outcome. For healing
    /// a failing sequence while a coordinator is running.
    #[allow(dead_code)]
    pub fn publish(&self, seq: u64, payload: &[u8]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(seq, VecDeque::from([FetchOutcome::Ready(payload.to_vec())]));
    }

    #[allow(dead_code)]
    pub fn set_remote(&self, remote: u64) {
        self.remote.store(remote, Ordering::SeqCst);
    }

    /// Every fetched sequence, in call order.
    #[allow(dead_code)]
    pub fn fetches(&self) -> Vec<u64> {
        self.fetch_log.lock().unwrap().iter().map(|(seq, _)| *seq).collect()
    }

    /// Call instants for one sequence, for poll-delay assertions.
    #[allow(dead_code)]
    pub fn fetch_times(&self, seq: u64) -> Vec<Instant> {
        self.fetch_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == seq)
            .map(|(_, at)| *at)
            .collect()
    }

    /// How many times one sequence was fetched.
    pub fn fetch_count(&self, seq: u64) -> usize {
        self.fetch_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == seq)
            .count()
    }
}

impl Default for ScriptedFeed {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DiffSource for ScriptedFeed {
    fn fetch(&self, seq: u64) -> BoxFuture<'_, FetchOutcome> {
        self.fetch_log.lock().unwrap().push((seq, Instant::now()));

        let outcome = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&seq) {
                // The last entry repeats; earlier entries are consumed.
                Some(script) if script.len() > 1 => script.pop_front().unwrap(),
                Some(script) => script
                    .front()
                    .cloned()
                    .unwrap_or(FetchOutcome::NotYetPublished),
                None => FetchOutcome::NotYetPublished,
            }
        };

        Box::pin(async move { Ok(outcome) })
    }

    fn current_remote_sequence(&self) -> BoxFuture<'_, u64> {
        let remote = self.remote.load(Ordering::SeqCst);
        Box::pin(async move { Ok(remote) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_consumes_script_in_order() {
        let feed = ScriptedFeed::new(5)
            .unpublished(3, 2)
            .ready(3, b"<osm/>");

        assert_eq!(feed.fetch(3).await.unwrap(), FetchOutcome::NotYetPublished);
        assert_eq!(feed.fetch(3).await.unwrap(), FetchOutcome::NotYetPublished);
        assert!(feed.fetch(3).await.unwrap().is_ready());
        // Last entry repeats.
        assert!(feed.fetch(3).await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_feed_unscripted_sequence_is_unpublished() {
        let feed = ScriptedFeed::new(5);
        assert_eq!(feed.fetch(99).await.unwrap(), FetchOutcome::NotYetPublished);
    }

    #[tokio::test]
    async fn test_feed_records_fetches() {
        let feed = ScriptedFeed::new(5).ready(1, b"a").ready(2, b"b");

        feed.fetch(1).await.unwrap();
        feed.fetch(2).await.unwrap();
        feed.fetch(1).await.unwrap();

        assert_eq!(feed.fetches(), vec![1, 2, 1]);
        assert_eq!(feed.fetch_count(1), 2);
        assert_eq!(feed.fetch_times(2).len(), 1);
    }

    #[tokio::test]
    async fn test_feed_publish_overrides_script() {
        let feed = ScriptedFeed::new(5).failed(4, "boom");

        assert!(matches!(
            feed.fetch(4).await.unwrap(),
            FetchOutcome::Failed(_)
        ));

        feed.publish(4, b"<osm/>");
        assert!(feed.fetch(4).await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_feed_remote_sequence_is_mutable() {
        let feed = ScriptedFeed::new(10);
        assert_eq!(feed.current_remote_sequence().await.unwrap(), 10);

        feed.set_remote(12);
        assert_eq!(feed.current_remote_sequence().await.unwrap(), 12);
    }
}
