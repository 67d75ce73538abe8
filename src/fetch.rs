//! Replication diff retrieval.
//!
//! Fetches one numbered diff file at a time from the upstream
//! replication tree and classifies what happened, so the coordinators
//! can decide between retrying, waiting and recording a failure
//! without ever inspecting HTTP details themselves.
//!
//! # Outcome Classification
//!
//! ```text
//! 2xx                          → Ready(bytes)
//! 404 / 410                    → NotYetPublished   (sequence not minted yet)
//! 429 / 5xx / timeout / connect → Transient         (retried with backoff)
//! anything else                → Failed            (recorded, not retried)
//! ```
//!
//! 404 is the normal steady-state answer when the tail has caught up
//! with the publisher, which is why it is not an error here.
//!
//! # Politeness
//!
//! Every request, whatever its outcome, passes the shared
//! [`Throttle`] first. The upstream replication server is a shared
//! community resource; one request per `throttle_delay` is the
//! contract, backfill workers included.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use changeset_sync::config::ReplicationConfig;
//! use changeset_sync::fetch::{FetchOutcome, ReplicationClient};
//!
//! let client = ReplicationClient::new(&ReplicationConfig::default())?;
//! match client.fetch(6_451_234).await {
//!     FetchOutcome::Ready(bytes) => println!("got {} bytes", bytes.len()),
//!     FetchOutcome::NotYetPublished => println!("caught up"),
//!     other => eprintln!("fetch problem: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

use tracing::{debug, warn};

use crate::config::ReplicationConfig;
use crate::error::{IngestError, Result};
use crate::gateway::BoxFuture;
use crate::metrics;
use crate::resilience::{RetryConfig, Throttle};

/// What happened to one diff request.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The diff exists; raw (still compressed) payload bytes.
    Ready(Vec<u8>),
    /// The sequence has not been published yet. Expected at the tail.
    NotYetPublished,
    /// A failure worth retrying (rate limit, server error, network).
    Transient(String),
    /// A failure retrying will not fix. Recorded in the tracker.
    Failed(String),
}

impl FetchOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, FetchOutcome::Ready(_))
    }

    /// Stable label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Ready(_) => "ready",
            FetchOutcome::NotYetPublished => "not_yet_published",
            FetchOutcome::Transient(_) => "transient",
            FetchOutcome::Failed(_) => "failed",
        }
    }
}

/// Source of replication diffs, as the coordinators see it.
///
/// Production wires in [`ReplicationClient`]; tests drive the
/// coordinators with scripted sources instead of a live server.
pub trait DiffSource: Send + Sync + 'static {
    /// Fetch one sequence, retrying transient failures internally.
    fn fetch(&self, seq: u64) -> BoxFuture<'_, FetchOutcome>;

    /// Highest sequence the upstream has published.
    fn current_remote_sequence(&self) -> BoxFuture<'_, u64>;
}

/// HTTP client for the upstream replication tree.
pub struct ReplicationClient {
    client: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
    throttle: Throttle,
}

impl ReplicationClient {
    pub fn new(config: &ReplicationConfig) -> Result<Self> {
        let retry = config.retry();
        let client = reqwest::Client::builder()
            .timeout(retry.request_timeout)
            .user_agent(concat!("changeset-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::Internal(format!("HTTP client construction: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry,
            throttle: Throttle::new(config.throttle()),
        })
    }

    /// URL of one diff: the sequence zero-padded to nine digits and
    /// split 3/3/3 into the directory fan-out.
    ///
    /// Sequence 6451234 lives at `{base}/006/451/234.osm.gz`.
    pub fn diff_url(&self, seq: u64) -> String {
        let padded = format!("{seq:09}");
        let (head, rest) = padded.split_at(padded.len() - 6);
        let (mid, tail) = rest.split_at(3);
        format!("{}/{}/{}/{}.osm.gz", self.base_url, head, mid, tail)
    }

    fn state_url(&self) -> String {
        format!("{}/state.yaml", self.base_url)
    }

    /// One throttled request, no retries.
    pub async fn fetch_once(&self, seq: u64) -> FetchOutcome {
        self.throttle.acquire().await;

        let url = self.diff_url(seq);
        let outcome = match self.client.get(&url).send().await {
            Err(e) if e.is_timeout() => FetchOutcome::Transient(format!("request timed out: {e}")),
            Err(e) if e.is_connect() => FetchOutcome::Transient(format!("connect failed: {e}")),
            Err(e) => FetchOutcome::Transient(format!("request failed: {e}")),
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    match response.bytes().await {
                        Ok(bytes) => FetchOutcome::Ready(bytes.to_vec()),
                        Err(e) => FetchOutcome::Transient(format!("body read failed: {e}")),
                    }
                } else {
                    match status.as_u16() {
                        404 | 410 => FetchOutcome::NotYetPublished,
                        429 => FetchOutcome::Transient("HTTP 429 rate limited".to_string()),
                        s if status.is_server_error() => {
                            FetchOutcome::Transient(format!("HTTP {s}"))
                        }
                        s => FetchOutcome::Failed(format!("HTTP {s}")),
                    }
                }
            }
        };

        metrics::record_fetch_outcome(outcome.label());
        outcome
    }

    /// Fetch with bounded backoff on transient failures.
    ///
    /// `Ready`, `NotYetPublished` and `Failed` return immediately;
    /// `Transient` sleeps and retries, degrading to `Failed` once the
    /// attempt budget is spent.
    pub async fn fetch(&self, seq: u64) -> FetchOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_once(seq).await {
                FetchOutcome::Transient(message) => {
                    if attempt >= self.retry.max_attempts {
                        warn!(
                            seq,
                            attempt,
                            error = %message,
                            "Transient fetch failures exhausted retry budget"
                        );
                        return FetchOutcome::Failed(format!(
                            "transient failures exhausted {attempt} attempts: {message}"
                        ));
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(
                        seq,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient fetch failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                outcome => {
                    debug!(seq, outcome = outcome.label(), attempt, "Fetch settled");
                    return outcome;
                }
            }
        }
    }

    /// Read the publisher's state file and return the newest sequence.
    ///
    /// Used to seed an empty checkpoint and to bound backfill planning.
    pub async fn current_remote_sequence(&self) -> Result<u64> {
        let url = self.state_url();
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.throttle.acquire().await;

            let transient = match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = response.text().await.map_err(|e| {
                            IngestError::http_msg(None, format!("state body read failed: {e}"))
                        })?;
                        return parse_state_sequence(&body);
                    } else if status.as_u16() == 429 || status.is_server_error() {
                        format!("HTTP {status}")
                    } else {
                        return Err(IngestError::http_msg(
                            None,
                            format!("state fetch rejected: HTTP {status}"),
                        ));
                    }
                }
                Err(e) => format!("{e}"),
            };

            if attempt >= self.retry.max_attempts {
                return Err(IngestError::RetriesExhausted {
                    operation: "state fetch".to_string(),
                    attempts: attempt,
                    last_error: transient,
                });
            }
            let delay = self.retry.delay_for_attempt(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %transient,
                   "State fetch failed, backing off");
            tokio::time::sleep(delay).await;
        }
    }
}

impl DiffSource for ReplicationClient {
    fn fetch(&self, seq: u64) -> BoxFuture<'_, FetchOutcome> {
        Box::pin(async move { Ok(ReplicationClient::fetch(self, seq).await) })
    }

    fn current_remote_sequence(&self) -> BoxFuture<'_, u64> {
        Box::pin(ReplicationClient::current_remote_sequence(self))
    }
}

/// Pull the `sequence:` value out of the publisher's state file.
///
/// The file is a small YAML document; only that one line matters here,
/// so it is matched textually rather than through a YAML parser.
fn parse_state_sequence(body: &str) -> Result<u64> {
    for line in body.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("sequence:") {
            return value.trim().parse().map_err(|e| {
                IngestError::Internal(format!("state file sequence {value:?} unparseable: {e}"))
            });
        }
    }
    Err(IngestError::Internal(
        "state file has no sequence line".to_string(),
    ))
}
