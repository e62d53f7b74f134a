//! # Routing-Table Snapshots
//!
//! The peer's identity lives in its routing table, so the table's data model
//! can be written to disk and reloaded on the next start: the local peer
//! descriptor plus every materialized bucket with its peers in refresh order.
//!
//! The on-disk format is bincode. Reading uses a bounded deserializer so a
//! damaged or hostile file cannot balloon allocations; structural validation
//! happens in [`RoutingTable::from_snapshot`](crate::RoutingTable::from_snapshot).

use std::path::Path;

use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::identity::Peer;

/// Upper bound on a snapshot file. A full table is 160 buckets of 8 peers,
/// far below this.
const MAX_SNAPSHOT_SIZE: u64 = 1024 * 1024;

/// Persisted form of one bucket: its slot plus peers, least-recently-refreshed
/// first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    pub index: usize,
    pub peers: Vec<Peer>,
}

/// Persisted form of the whole routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub self_peer: Peer,
    pub buckets: Vec<BucketSnapshot>,
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_SNAPSHOT_SIZE)
        .with_fixint_encoding()
}

/// Write a snapshot to `path`, replacing whatever was there.
pub async fn save(path: &Path, snapshot: &TableSnapshot) -> Result<()> {
    let raw = bincode::serialize(snapshot).context("encoding routing table snapshot")?;
    tokio::fs::write(path, raw)
        .await
        .with_context(|| format!("writing routing table to {}", path.display()))
}

/// Read a snapshot back from `path`.
pub async fn load(path: &Path) -> Result<TableSnapshot> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading routing table from {}", path.display()))?;
    bincode_options()
        .deserialize(&raw)
        .with_context(|| format!("decoding routing table from {}", path.display()))
}
