//! # ChronolithDB Query Layer
//!
//! Range queries over the shard space: the planner walks every wall-clock
//! bucket a time range touches (plus a one-day rewind at the lower edge),
//! filters through the directory index so absent shards cost nothing,
//! concatenates the surviving points in scan order, and hands them to one
//! of the built-in aggregations or a caller-supplied reducer. Identical
//! requests are memoized until the next mutation invalidates the cache.

mod aggregate;
mod cache;
mod executor;

pub use aggregate::{apply, Aggregation, AggregateOutput};
pub use cache::{fingerprint, QueryCache};
pub use executor::QueryExecutor;
