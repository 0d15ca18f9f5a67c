//! RAM write buffer.
//!
//! Freshly written points accumulate here per shard path until a flush
//! migrates them to disk. The buffer tracks an estimate of its serialized
//! size (one byte per character of the JSON encoding, matching the on-disk
//! cost) so the engine can trigger an overflow flush before the ceiling is
//! crossed by much. Points are never dropped: a point leaves the buffer
//! only by being drained into a flush.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::trace;

use chronolithdb_core::types::Point;

/// Serialized-size estimate for one point, including its separator.
fn point_cost(point: &Point) -> usize {
    // to_string on a Point cannot fail; fall back to a generous guess so a
    // hypothetical failure can only over-count, never under-count.
    serde_json::to_string(point).map(|s| s.len() + 1).unwrap_or(64)
}

/// Per-shard accumulator of pending points.
#[derive(Debug, Default)]
pub struct RamBuffer {
    pending: HashMap<PathBuf, Vec<Point>>,
    estimated_bytes: usize,
}

impl RamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a point to its shard's pending list and return the new
    /// serialized-size estimate.
    pub fn append(&mut self, shard_path: &Path, point: Point) -> usize {
        self.estimated_bytes += point_cost(&point);
        self.pending
            .entry(shard_path.to_path_buf())
            .or_default()
            .push(point);
        trace!(
            target: "chronolithdb::buffer",
            shard = %shard_path.display(),
            estimated_bytes = self.estimated_bytes,
            "buffered point"
        );
        self.estimated_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total pending points across all shards.
    pub fn point_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    /// Take every pending list, leaving the buffer empty. Iteration order
    /// is sorted by shard path so flushes touch files deterministically.
    pub fn drain(&mut self) -> Vec<(PathBuf, Vec<Point>)> {
        self.estimated_bytes = 0;
        let mut drained: Vec<(PathBuf, Vec<Point>)> = self.pending.drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.estimated_bytes = 0;
    }
}
