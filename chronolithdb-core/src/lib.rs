//! Shared foundation for the ChronolithDB workspace.
//!
//! This crate carries the vocabulary every other subsystem speaks: the
//! [`Point`] sample record with its compact on-disk projection, the
//! [`Frame`] bucket granularity, the [`EngineConfig`] options surface, and
//! the [`StoreError`] taxonomy. It has no I/O of its own.

pub mod config;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use error::{Result, StoreError};
pub use types::{Frame, Point};
