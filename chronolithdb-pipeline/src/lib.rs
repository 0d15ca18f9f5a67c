//! # ChronolithDB Async Write Pipeline
//!
//! The auxiliary stores of the suite move large JSON blobs through a
//! cooperative, single-threaded job queue so the host's UI loop is never
//! starved: each queued job advances in bounded time slices interleaved
//! with the host's event loop, and the queue re-arms a timer with a
//! backpressure delay between slices.
//!
//! Two pieces live here:
//!
//! - [`CooperativeQueue`]: the strict-FIFO slice scheduler, an owned
//!   resource on the engine handle (not a process-wide singleton).
//! - the streaming codec ([`EncodeState`] / [`DecodeState`]): a
//!   newline-delimited, token-compressed record format whose encoder and
//!   decoder are explicit state machines that yield between chunks.
//!
//! The on-disk format is fixed by compatibility: the first line is a meta
//! record (`T`/`A` tokens, scalars inline, array fields as lengths), every
//! further line is an item record `{"T": field, "D": element}`, and readers
//! also accept a legacy single-object JSON blob written by the
//! save-and-quit fallback.

mod codec;
mod jobs;
mod queue;

pub use codec::{decode_text, DecodeState, EncodeState};
pub use jobs::{CopyJob, StreamReadJob, StreamWriteJob};
pub use queue::{backpressure_delay, CooperativeQueue, QueueJob, SliceOutcome};
