//! Configuration for the changeset sync engine.
//!
//! All settings come with working defaults; a deployment typically only
//! overrides the store path and, for the archive run, the date bounds.
//! Durations are humantime strings (`"500ms"`, `"60s"`, `"5m"`).
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── store: StoreConfig             # SQLite path, bbox extent filter
//! ├── replication: ReplicationConfig # base URL, throttle, retry bounds
//! ├── archive: ArchiveConfig         # bootstrap pipeline shape + filters
//! ├── live_tail: LiveTailConfig      # poll interval, start override
//! └── backfill: BackfillConfig       # worker pool, oldest boundary
//! ```
//!
//! # TOML Example
//!
//! ```toml
//! [store]
//! path = "/var/lib/changesets/changesets.db"
//! max_bbox_extent_degrees = 90.0
//!
//! [replication]
//! base_url = "https://planet.osm.org/replication/changesets"
//! throttle_delay = "1s"
//! request_timeout = "30s"
//! max_attempts = 5
//!
//! [archive]
//! worker_count = 8
//! queue_depth = 8
//! batch_size = 25000
//! truncate = false
//! from_date = "2023-01-01"
//! to_date = "2023-12-31"
//!
//! [live_tail]
//! poll_interval = "60s"
//!
//! [backfill]
//! enabled = true
//! worker_count = 4
//! oldest_sequence = 5000000
//! ```
//!
//! Environment overrides (`CHANGESET_DB_PATH`, `CHANGESET_BASE_URL`,
//! `CHANGESET_THROTTLE_DELAY`, `CHANGESET_POLL_INTERVAL`,
//! `CHANGESET_OLDEST_SEQUENCE`) are applied after file loading, so a
//! container deployment can ship one config file and specialize per
//! instance.

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::resilience::RetryConfig;

// ═══════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════

/// Root configuration for the engine and both binaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub live_tail: LiveTailConfig,

    #[serde(default)]
    pub backfill: BackfillConfig,
}

impl SyncConfig {
    /// Parse config from a TOML string, apply env overrides, validate.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(toml_str)
            .map_err(|e| IngestError::Config(format!("invalid TOML: {e}")))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            IngestError::Config(format!(
                "cannot read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Defaults with env overrides applied (no config file).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Fast everything, pointed at a caller-supplied store path.
    pub fn for_testing(store_path: impl Into<String>) -> Self {
        Self {
            store: StoreConfig {
                path: store_path.into(),
                ..StoreConfig::default()
            },
            replication: ReplicationConfig {
                throttle_delay: "0s".to_string(),
                request_timeout: "500ms".to_string(),
                max_attempts: 3,
                initial_backoff: "10ms".to_string(),
                max_backoff: "100ms".to_string(),
                ..ReplicationConfig::default()
            },
            archive: ArchiveConfig {
                worker_count: 2,
                queue_depth: 2,
                batch_size: 10,
                max_write_attempts: 3,
                ..ArchiveConfig::default()
            },
            live_tail: LiveTailConfig {
                poll_interval: "20ms".to_string(),
                ..LiveTailConfig::default()
            },
            backfill: BackfillConfig {
                worker_count: 2,
                ..BackfillConfig::default()
            },
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CHANGESET_DB_PATH") {
            self.store.path = v;
        }
        if let Ok(v) = std::env::var("CHANGESET_BASE_URL") {
            self.replication.base_url = v;
        }
        if let Ok(v) = std::env::var("CHANGESET_THROTTLE_DELAY") {
            self.replication.throttle_delay = v;
        }
        if let Ok(v) = std::env::var("CHANGESET_POLL_INTERVAL") {
            self.live_tail.poll_interval = v;
        }
        if let Ok(v) = std::env::var("CHANGESET_OLDEST_SEQUENCE") {
            if let Ok(seq) = v.parse() {
                self.backfill.oldest_sequence = seq;
            }
        }
    }

    /// Check the whole tree. Called once at startup; configuration
    /// errors are fatal, never retried.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.replication.validate()?;
        self.archive.validate()?;
        self.live_tail.validate()?;
        self.backfill.validate()?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════

/// Settings for the SQLite-backed changeset store and sequence tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the database file. Created if missing.
    #[serde(default = "default_store_path")]
    pub path: String,

    /// Maximum bounding-box extent, in degrees, on either axis. Events
    /// with a larger box are dropped before they reach the store.
    #[serde(default = "default_max_bbox_extent")]
    pub max_bbox_extent_degrees: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            max_bbox_extent_degrees: default_max_bbox_extent(),
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(IngestError::Config("store.path is empty".to_string()));
        }
        if !(self.max_bbox_extent_degrees > 0.0 && self.max_bbox_extent_degrees <= 360.0) {
            return Err(IngestError::Config(format!(
                "store.max_bbox_extent_degrees must be in (0, 360], got {}",
                self.max_bbox_extent_degrees
            )));
        }
        Ok(())
    }
}

fn default_store_path() -> String {
    "changesets.db".to_string()
}

fn default_max_bbox_extent() -> f64 {
    90.0
}

// ═══════════════════════════════════════════════════════════════════════════
// Replication fetch
// ═══════════════════════════════════════════════════════════════════════════

/// Settings for the upstream replication server client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Base URL of the minutely changeset replication tree.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Minimum spacing between requests, applied on every outcome.
    #[serde(default = "default_throttle_delay")]
    pub throttle_delay: String,

    /// Per-request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Attempts per sequence before a transient failure becomes permanent.
    #[serde(default = "default_fetch_attempts")]
    pub max_attempts: usize,

    /// First backoff delay after a transient failure.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: String,

    /// Backoff ceiling.
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            throttle_delay: default_throttle_delay(),
            request_timeout: default_request_timeout(),
            max_attempts: default_fetch_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl ReplicationConfig {
    /// Parsed throttle spacing.
    pub fn throttle(&self) -> Duration {
        parse_duration_or(&self.throttle_delay, Duration::from_secs(1))
    }

    /// Retry schedule for transient fetch failures.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: parse_duration_or(&self.initial_backoff, Duration::from_millis(500)),
            max_delay: parse_duration_or(&self.max_backoff, Duration::from_secs(60)),
            backoff_factor: 2.0,
            request_timeout: parse_duration_or(&self.request_timeout, Duration::from_secs(30)),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(IngestError::Config(
                "replication.base_url is empty".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(IngestError::Config(
                "replication.max_attempts must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("replication.throttle_delay", &self.throttle_delay),
            ("replication.request_timeout", &self.request_timeout),
            ("replication.initial_backoff", &self.initial_backoff),
            ("replication.max_backoff", &self.max_backoff),
        ] {
            humantime::parse_duration(value)
                .map_err(|e| IngestError::Config(format!("{name}: {e}")))?;
        }
        Ok(())
    }
}

fn default_base_url() -> String {
    "https://planet.osm.org/replication/changesets".to_string()
}

fn default_throttle_delay() -> String {
    "1s".to_string()
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

fn default_fetch_attempts() -> usize {
    5
}

fn default_initial_backoff() -> String {
    "500ms".to_string()
}

fn default_max_backoff() -> String {
    "60s".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════
// Archive bootstrap
// ═══════════════════════════════════════════════════════════════════════════

/// Settings for the one-shot bulk archive load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Worker tasks applying batches to the store.
    #[serde(default = "default_archive_workers")]
    pub worker_count: usize,

    /// Bounded queue depth between the reader and the workers. The
    /// reader blocks when the queue is full.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Events per batch handed to a worker.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Read buffer for the decompressing reader, in bytes.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Destructive: empty the changesets table before loading.
    #[serde(default)]
    pub truncate: bool,

    /// Inclusive lower bound on created_at (`YYYY-MM-DD`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_date: Option<String>,

    /// Inclusive upper bound on created_at (`YYYY-MM-DD`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_date: Option<String>,

    /// Attempts per batch write before the whole run aborts.
    #[serde(default = "default_write_attempts")]
    pub max_write_attempts: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            worker_count: default_archive_workers(),
            queue_depth: default_queue_depth(),
            batch_size: default_batch_size(),
            read_buffer_size: default_read_buffer_size(),
            truncate: false,
            from_date: None,
            to_date: None,
            max_write_attempts: default_write_attempts(),
        }
    }
}

impl ArchiveConfig {
    /// Parsed inclusive date bounds, if configured.
    pub fn date_bounds(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        let from = parse_date_opt("archive.from_date", self.from_date.as_deref())?;
        let to = parse_date_opt("archive.to_date", self.to_date.as_deref())?;
        if let (Some(f), Some(t)) = (from, to) {
            if f > t {
                return Err(IngestError::Config(format!(
                    "archive.from_date {f} is after archive.to_date {t}"
                )));
            }
        }
        Ok((from, to))
    }

    fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(IngestError::Config(
                "archive.worker_count must be at least 1".to_string(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(IngestError::Config(
                "archive.queue_depth must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(IngestError::Config(
                "archive.batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_write_attempts == 0 {
            return Err(IngestError::Config(
                "archive.max_write_attempts must be at least 1".to_string(),
            ));
        }
        self.date_bounds()?;
        Ok(())
    }
}

fn default_archive_workers() -> usize {
    8
}

fn default_queue_depth() -> usize {
    8
}

fn default_batch_size() -> usize {
    25_000
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

fn default_write_attempts() -> usize {
    5
}

// ═══════════════════════════════════════════════════════════════════════════
// Live tail
// ═══════════════════════════════════════════════════════════════════════════

/// Settings for the forward replication loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveTailConfig {
    /// Sleep between polls while the next sequence is unpublished.
    /// Upstream publishes roughly once a minute.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Start here instead of discovering the remote sequence when the
    /// checkpoint is empty. Ignored once a checkpoint exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_sequence: Option<u64>,
}

impl Default for LiveTailConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            start_sequence: None,
        }
    }
}

impl LiveTailConfig {
    pub fn poll_interval(&self) -> Duration {
        parse_duration_or(&self.poll_interval, Duration::from_secs(60))
    }

    fn validate(&self) -> Result<()> {
        humantime::parse_duration(&self.poll_interval)
            .map_err(|e| IngestError::Config(format!("live_tail.poll_interval: {e}")))?;
        Ok(())
    }
}

fn default_poll_interval() -> String {
    "60s".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════
// Backfill
// ═══════════════════════════════════════════════════════════════════════════

/// Settings for historical catch-up below the live tip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Run the backfill pool alongside live-tail.
    #[serde(default = "default_backfill_enabled")]
    pub enabled: bool,

    /// Concurrent backfill workers.
    #[serde(default = "default_backfill_workers")]
    pub worker_count: usize,

    /// Oldest sequence the backfill will reach for. 0 means the start
    /// of the replication feed.
    #[serde(default)]
    pub oldest_sequence: u64,

    /// Also re-queue sequences previously marked failed.
    #[serde(default)]
    pub retry_failed: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: default_backfill_enabled(),
            worker_count: default_backfill_workers(),
            oldest_sequence: 0,
            retry_failed: false,
        }
    }
}

impl BackfillConfig {
    fn validate(&self) -> Result<()> {
        if self.enabled && self.worker_count == 0 {
            return Err(IngestError::Config(
                "backfill.worker_count must be at least 1 when enabled".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_backfill_enabled() -> bool {
    true
}

fn default_backfill_workers() -> usize {
    4
}

// ═══════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

fn parse_date_opt(name: &str, value: Option<&str>) -> Result<Option<NaiveDate>> {
    match value {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| IngestError::Config(format!("{name}: {e} (expected YYYY-MM-DD)"))),
    }
}
