// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the changeset sync engine.
//!
//! Errors are categorized by their source (upstream HTTP, local store,
//! payload decoding, etc.) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Http` | Yes | Network errors, timeouts, 5xx from the replication server |
//! | `Store` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `Decompress` | No | Payload corruption (gzip/zstd decode failed) |
//! | `DiffParse` | No | Diff stream unreadable beyond element skipping |
//! | `RetriesExhausted` | No | Bounded retry gave up; recorded against the owner |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`IngestError::is_retryable()`] to decide whether an operation
//! should be retried with backoff. Retryable errors indicate transient
//! network or availability issues. Non-retryable errors indicate bugs,
//! configuration problems, or data corruption. Note that a malformed
//! single element in a diff is not an error at all: the parser skips it
//! and keeps going (see `diff`).

use thiserror::Error;

/// Result type alias for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors that can occur during ingestion.
///
/// Each variant includes context about where the error occurred.
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried.
#[derive(Error, Debug)]
pub enum IngestError {
    /// HTTP error talking to the replication server.
    ///
    /// Covers connect failures, timeouts and unexpected status codes.
    /// Typically retryable; the fetcher classifies the specific outcome.
    #[error("HTTP error{}: {message}", sequence_suffix(.sequence))]
    Http {
        sequence: Option<u64>,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// SQLite error from the changeset store or sequence tracker.
    ///
    /// Not retryable at this level - busy/locked conditions are already
    /// retried inside the store; anything surfacing here needs attention.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    ///
    /// Fatal at startup - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Gzip/zstd decompression failure.
    ///
    /// The payload is corrupted or truncated at the source.
    #[error("Decompression error: {0}")]
    Decompress(String),

    /// The diff byte stream is unreadable.
    ///
    /// Individual malformed elements are skipped by the parser and never
    /// surface here; this variant means the stream itself broke (I/O
    /// failure mid-read, truncated container).
    #[error("Diff parse error: {0}")]
    DiffParse(String),

    /// A bounded retry loop gave up.
    ///
    /// The owning unit of work (sequence or archive run) is marked failed.
    #[error("Retries exhausted for {operation} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: usize,
        last_error: String,
    },

    /// Engine state machine violation.
    ///
    /// An operation was attempted in the wrong state (e.g. `start()` on
    /// an already-running engine). Indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// Create an HTTP error from a reqwest error, tagged with the sequence.
    pub fn http(sequence: impl Into<Option<u64>>, source: reqwest::Error) -> Self {
        Self::Http {
            sequence: sequence.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create an HTTP error without an underlying reqwest source.
    pub fn http_msg(sequence: impl Into<Option<u64>>, message: impl Into<String>) -> Self {
        Self::Http {
            sequence: sequence.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { .. } => true, // Network errors are retryable
            Self::Store(_) => false,   // Local DB issues need attention
            Self::Config(_) => false,
            Self::Decompress(_) => false, // Data corruption
            Self::DiffParse(_) => false,  // Data corruption
            Self::RetriesExhausted { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(e: reqwest::Error) -> Self {
        Self::http(None, e)
    }
}

fn sequence_suffix(sequence: &Option<u64>) -> String {
    match sequence {
        Some(s) => format!(" (sequence {s})"),
        None => String::new(),
    }
}
