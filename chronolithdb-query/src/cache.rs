//! Query result memoization.
//!
//! Entries live for the process lifetime and are invalidated wholesale on
//! any mutation (flush, purge, clear, restore) by the engine facade. The
//! fingerprint is deterministic: the ISO-8601 UTC bounds plus the
//! aggregation key.

use dashmap::DashMap;

use crate::aggregate::AggregateOutput;

/// Build the deterministic cache fingerprint for a query.
pub fn fingerprint(start_iso: &str, end_iso: &str, aggregation_key: &str) -> String {
    format!("{start_iso}|{end_iso}|{aggregation_key}")
}

/// Fingerprint → result map.
#[derive(Debug, Default)]
pub struct QueryCache {
    entries: DashMap<String, AggregateOutput>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recall(&self, fingerprint: &str) -> Option<AggregateOutput> {
        self.entries.get(fingerprint).map(|entry| entry.clone())
    }

    pub fn remember(&self, fingerprint: String, output: AggregateOutput) {
        self.entries.insert(fingerprint, output);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
