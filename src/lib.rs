//! # ChronolithDB
//!
//! An embedded-class time-series storage engine for constrained devices:
//! single digits of MB of RAM, slow flash, short bursts of CPU.
//!
//! Tagged numeric samples are buffered in memory, sharded to small JSON
//! files organized by UTC wall-clock bucket (one file per hour or minute),
//! tracked by a checksum-protected directory index with automatic
//! recovery, and answered back through range queries with a library of
//! built-in aggregations or a caller-supplied reducer. A cooperative,
//! single-threaded job queue streams large auxiliary JSON blobs to disk in
//! small time slices so the host's UI loop is never starved.
//!
//! ```no_run
//! use chronolithdb::{EngineConfig, TimeSeriesEngine};
//!
//! # async fn demo() -> chronolithdb::Result<()> {
//! let engine = TimeSeriesEngine::open(EngineConfig::default()).await?;
//! engine.write_point("temperature", 21.5)?;
//! engine.flush()?;
//! let avg = engine.query(1_710_000_000_000, 1_710_604_800_000, "average")?;
//! println!("{:?}", avg);
//! engine.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! The engine is single-writer, single-reader within one process instance
//! and owns its data directory; there is no SQL surface, no replication,
//! and no multi-process access.

mod engine;

pub use engine::{DatabaseStats, TimeSeriesEngine, BACKUP_DIRECTORY};

pub use chronolithdb_core::config::EngineConfig;
pub use chronolithdb_core::error::{Result, StoreError};
pub use chronolithdb_core::types::{Frame, Point};
pub use chronolithdb_pipeline::CooperativeQueue;
pub use chronolithdb_query::{AggregateOutput, Aggregation};
