//! Engine state types.
//!
//! Defines the state machine for the sync engine lifecycle and the
//! health snapshot reported to operators.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (already stopped)            │ (tasks spawned)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!                              │
//!                    (coordinator error)
//!                              ↓
//!                           Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `SyncEngine::open()`. Nothing running.
//! - **Starting**: `start()` called, recovering stale claims and spawning tasks.
//! - **Running**: Live-tail is applying sequences; backfill may be catching up.
//! - **ShuttingDown**: `shutdown()` called. In-flight sequences are draining.
//! - **Stopped**: Graceful shutdown complete. Safe to drop.
//! - **Failed**: A coordinator hit an unrecoverable error. Check logs.

/// State of the sync engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::SyncEngine::start) to begin syncing.
    Created,

    /// Recovering stale claims and spawning coordinator tasks.
    Starting,

    /// Running.
    ///
    /// Live-tail is applying newly published sequences in order.
    /// Backfill, when enabled, is claiming older sequences.
    Running,

    /// Shutting down gracefully.
    ///
    /// In-flight sequences either complete or are left `processing`
    /// for the next start's stale-claim recovery.
    ShuttingDown,

    /// Stopped.
    ///
    /// Engine has shut down cleanly and the store is closed.
    Stopped,

    /// A coordinator hit an unrecoverable error.
    ///
    /// The sequences table still reflects everything applied so far;
    /// a restart resumes from the durable checkpoint.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time health snapshot for monitoring.
///
/// Produced by [`health_check()`](super::SyncEngine::health_check) from
/// the durable tracker tables plus one best-effort remote probe.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Current engine state.
    pub state: EngineState,
    /// Running with no failed sequences.
    pub healthy: bool,
    /// Highest contiguously applied sequence.
    pub current_tip: u64,
    /// Highest sequence live-tail has attempted, applied or not. A
    /// growing gap against `current_tip` means the tip is stuck on a
    /// failing sequence.
    pub last_processed: u64,
    /// Sequences waiting to be claimed.
    pub pending_sequences: u64,
    /// Sequences currently claimed by a worker.
    pub processing_sequences: u64,
    /// Sequences that failed permanently.
    pub failed_sequences: u64,
    /// Latest sequence the upstream reports, when reachable.
    pub remote_sequence: Option<u64>,
    /// Sequences the tip is behind the upstream, when known.
    pub backlog: Option<u64>,
    /// Rows in the changesets table.
    pub changeset_count: u64,
}
