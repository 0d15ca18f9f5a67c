//! Query planner and executor.
//!
//! The scan is bucket-inclusive: every shard whose bucket touches the
//! `[start, end]` range is loaded in full and no per-point timestamp
//! filtering is applied. Callers that need strict point-wise bounds take
//! the raw series and filter themselves. The cursor starts one day before
//! `start` (a deliberate over-scan kept for compatibility with the
//! engine's historical range semantics at the lower bucket boundary) and
//! advances one bucket per step while it is at most `end`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat};
use tracing::{debug, warn};

use chronolithdb_core::error::{Result, StoreError};
use chronolithdb_core::types::{Frame, Point};
use chronolithdb_storage::{read_shard, route, IndexManager};

use crate::aggregate::{apply, AggregateOutput, Aggregation};
use crate::cache::{fingerprint, QueryCache};

const REWIND_MS: i64 = 86_400_000; // one day

/// Cache key used for caller-supplied reducers. Two different custom
/// reducers over the same range share this fingerprint; callers that
/// interleave distinct reducers flush between them.
const CUSTOM_KEY: &str = "custom";

/// Normalize a millisecond timestamp to an ISO-8601 UTC string.
fn iso_utc(timestamp_ms: i64) -> Result<String> {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| StoreError::Parse {
            path: String::new(),
            detail: format!("timestamp {timestamp_ms} is outside the representable range"),
        })
}

/// Executes range scans and memoizes aggregate results.
#[derive(Debug)]
pub struct QueryExecutor {
    directory: PathBuf,
    frame: Frame,
    cache: QueryCache,
}

impl QueryExecutor {
    pub fn new(directory: PathBuf, frame: Frame) -> Self {
        Self {
            directory,
            frame,
            cache: QueryCache::new(),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Walk the bucket space for the range and concatenate every indexed
    /// shard's points in scan order. Absent buckets are skipped via the
    /// index; unreadable or corrupt shards are logged and skipped without
    /// poisoning their neighbors.
    pub fn scan(&self, index: &IndexManager, start_ms: i64, end_ms: i64) -> Result<Vec<Point>> {
        let mut points = Vec::new();
        let step = self.frame.bucket_ms();
        let mut cursor = start_ms.saturating_sub(REWIND_MS);
        while cursor <= end_ms {
            let addr = route(&self.directory, cursor, self.frame)?;
            cursor += step;
            if !index.contains(&addr.date_key, &addr.hour_key, addr.minute_key.as_deref()) {
                continue;
            }
            match read_shard(&addr.path) {
                Ok(shard_points) => points.extend(shard_points),
                Err(e) => {
                    warn!(
                        target: "chronolithdb::query",
                        shard = %addr.path.display(),
                        error = %e,
                        "skipping unreadable shard"
                    );
                }
            }
        }
        Ok(points)
    }

    /// Run a named aggregation over the range, memoized by fingerprint.
    pub fn query(
        &self,
        index: &IndexManager,
        start_ms: i64,
        end_ms: i64,
        aggregation: Aggregation,
    ) -> Result<AggregateOutput> {
        let key = fingerprint(
            &iso_utc(start_ms)?,
            &iso_utc(end_ms)?,
            &aggregation.cache_key(),
        );
        if let Some(hit) = self.cache.recall(&key) {
            debug!(target: "chronolithdb::query", fingerprint = %key, "cache hit");
            return Ok(hit);
        }
        let points = self.scan(index, start_ms, end_ms)?;
        let output = apply(aggregation, &points);
        self.cache.remember(key, output.clone());
        Ok(output)
    }

    /// Run a caller-supplied reducer over the range. Memoized under the
    /// shared `custom` aggregation key.
    pub fn query_custom<F>(
        &self,
        index: &IndexManager,
        start_ms: i64,
        end_ms: i64,
        reducer: F,
    ) -> Result<AggregateOutput>
    where
        F: FnOnce(&[Point]) -> AggregateOutput,
    {
        let key = fingerprint(&iso_utc(start_ms)?, &iso_utc(end_ms)?, CUSTOM_KEY);
        if let Some(hit) = self.cache.recall(&key) {
            debug!(target: "chronolithdb::query", fingerprint = %key, "cache hit");
            return Ok(hit);
        }
        let points = self.scan(index, start_ms, end_ms)?;
        let output = reducer(&points);
        self.cache.remember(key, output.clone());
        Ok(output)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}
