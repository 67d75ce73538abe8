//! # Changeset Sync
//!
//! An ingestion engine for an OSM-style changeset replication feed.
//!
//! ## Architecture
//!
//! The engine bootstraps a local SQLite store from a full archive dump,
//! then keeps it current against the upstream replication tree:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           changeset-sync                            │
//! │                                                                     │
//! │  ┌────────────────┐   ┌─────────────────┐   ┌─────────────────────┐ │
//! │  │ Archive loader │──►│ ChangesetReader │──►│ SqliteStore         │ │
//! │  │ (bootstrap)    │   │ (streaming XML) │   │ (rows + tracker)    │ │
//! │  └────────────────┘   └─────────────────┘   └─────────────────────┘ │
//! │                                                        ▲            │
//! │  ┌────────────────┐   ┌───────────────────┐            │            │
//! │  │ Live-tail      │──►│ ReplicationClient │────────────┤            │
//! │  │ (tip chasing)  │   │ (HTTP + backoff)  │            │            │
//! │  └────────────────┘   └───────────────────┘            │            │
//! │                                ▲                       │            │
//! │  ┌────────────────┐            │                       │            │
//! │  │ Backfill pool  │────────────┴───────────────────────┘            │
//! │  │ (older seqs)   │                                                 │
//! │  └────────────────┘                                                 │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two-Phase Ingestion
//!
//! 1. **Archive bootstrap**: one-shot bulk load of a changeset dump into
//!    SQLite, see [`archive::load_archive`]
//! 2. **Replication**: the live-tail loop chases the upstream head in
//!    strict order while an optional backfill pass catches up anything
//!    older, both through the same [`tracker::SequenceTracker`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use changeset_sync::{SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig::from_env().expect("config");
//!
//!     let mut engine = SyncEngine::open(config).await.expect("open");
//!     engine.start().await.expect("start");
//!
//!     // Engine runs until shutdown signal
//!     tokio::signal::ctrl_c().await.ok();
//!     engine.shutdown().await;
//! }
//! ```

pub mod archive;
pub mod config;
pub mod coordinator;
pub mod diff;
pub mod error;
pub mod fetch;
pub mod gateway;
pub mod metrics;
pub mod resilience;
pub mod store;
pub mod tracker;

// Re-exports for convenience
pub use archive::{load_archive, load_from_reader, ArchiveStats};
pub use config::{
    ArchiveConfig, BackfillConfig, LiveTailConfig, ReplicationConfig, StoreConfig, SyncConfig,
};
pub use coordinator::{BackfillStats, EngineState, HealthCheck, SyncEngine};
pub use diff::{ChangesetEvent, ChangesetReader, Geometry};
pub use error::{IngestError, Result};
pub use fetch::{DiffSource, FetchOutcome, ReplicationClient};
pub use gateway::ChangesetGateway;
pub use store::SqliteStore;
pub use tracker::{CheckpointState, SequenceStatus, SequenceTracker};
