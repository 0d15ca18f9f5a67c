//! Shard file I/O.
//!
//! A shard is a JSON array of compact points. Absent and zero-byte files
//! both mean "empty shard"; a file that exists but does not parse is a
//! [`StoreError::Parse`] and the caller decides whether to skip it (query)
//! or overwrite it (flush merge).

use std::path::Path;

use chronolithdb_core::error::{Result, StoreError};
use chronolithdb_core::types::Point;

use crate::fs::FsAdapter;

/// Load the points of one shard file.
pub fn read_shard(path: &Path) -> Result<Vec<Point>> {
    let text = match FsAdapter::read_text(path) {
        Ok(text) => text,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&text).map_err(|e| StoreError::parse(path, e.to_string()))
}

/// Rewrite one shard file with a single truncating write, preserving the
/// order of `points`.
pub fn write_shard(path: &Path, points: &[Point]) -> Result<()> {
    let text = serde_json::to_string(points)
        .map_err(|e| StoreError::parse(path, e.to_string()))?;
    FsAdapter::write_text_truncating(path, &text)
}
