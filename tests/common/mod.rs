//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A scripted diff feed standing in for the upstream server
//! - A recording gateway with failure injection
//! - Store fixtures and changeset XML builders

pub mod mock_feed;
pub mod mock_gateway;

pub use mock_feed::*;
pub use mock_gateway::*;

use std::sync::Arc;

use changeset_sync::{SequenceTracker, SqliteStore};
use tempfile::TempDir;

/// Open a fresh store and tracker pair on a file under `dir`.
///
/// The tracker shares the store's pool, exactly as the engine wires
/// them in production.
pub async fn open_store(dir: &TempDir) -> (Arc<SqliteStore>, SequenceTracker) {
    let store = Arc::new(
        SqliteStore::open(dir.path().join("test.db"))
            .await
            .expect("open sqlite store"),
    );
    let tracker = SequenceTracker::new(store.pool().clone())
        .await
        .expect("create tracker tables");
    (store, tracker)
}

/// One self-closing changeset element.
#[allow(dead_code)]
pub fn changeset_xml(id: i64, created_at: &str) -> String {
    format!(r#"<changeset id="{id}" created_at="{created_at}" open="true" num_changes="1"/>"#)
}

/// A plain (uncompressed) diff payload with one changeset per id,
/// all created on the same day.
pub fn diff_payload(ids: &[i64]) -> Vec<u8> {
    diff_payload_on(ids, "2023-05-01T12:00:00Z")
}

/// Like [`diff_payload`], with an explicit creation timestamp.
pub fn diff_payload_on(ids: &[i64], created_at: &str) -> Vec<u8> {
    let mut xml = String::from(r#"<osm version="0.6">"#);
    for id in ids {
        xml.push_str(&format!(
            r#"<changeset id="{id}" created_at="{created_at}" open="true" num_changes="1"/>"#
        ));
    }
    xml.push_str("</osm>");
    xml.into_bytes()
}
