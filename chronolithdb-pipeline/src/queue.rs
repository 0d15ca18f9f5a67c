//! Cooperative job queue.
//!
//! A single logical executor processing one job at a time in bounded time
//! slices, scheduled off the host's timer so the event loop breathes
//! between slices. Strict FIFO, no preemption inside a slice; between
//! slices the executor sleeps a backpressure delay that grows with the
//! queue depth, `min(100 + 25·queued, 300)` milliseconds.
//!
//! The queue is an owned resource on the engine handle. Its driver task is
//! started lazily on the first enqueue and parks itself when the queue
//! runs dry; `reset` drops pending work, and an emergency stop additionally
//! abandons the active job at its next yield (never mid-slice). An
//! abandoned job's completion channel is dropped, which its submitter
//! observes as cancellation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::{debug, trace};

/// What a job's slice reported back to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    /// More work remains; run another slice after the backpressure delay.
    Yielded,
    /// The job finished (successfully or not) and can be dropped.
    Complete,
}

/// A unit of cooperative work.
///
/// `tick` advances the job until either it completes or `deadline` passes;
/// implementations check the deadline between small steps (a few records,
/// one buffered chunk) and must not block past it by more than one step.
pub trait QueueJob: Send + 'static {
    fn tick(&mut self, deadline: Instant) -> SliceOutcome;

    /// Short label for logs.
    fn label(&self) -> &'static str {
        "job"
    }
}

/// Time budget of one slice.
pub const SLICE_BUDGET: Duration = Duration::from_millis(1);

/// Backpressure delay before the next slice given the current queue depth.
pub fn backpressure_delay(queued: usize) -> Duration {
    Duration::from_millis((100 + 25 * queued as u64).min(300))
}

/// Queue depth at which `is_busy` reports pressure even between jobs.
const BUSY_QUEUE_DEPTH: usize = 4;

#[derive(Default)]
struct QueueState {
    queued: VecDeque<Box<dyn QueueJob>>,
    /// A job is currently held by the driver (possibly mid-slice).
    active: bool,
    /// The driver task is alive.
    running: bool,
    /// Drop the active job at its next yield instead of re-slicing it.
    abandon_active: bool,
}

/// Single-threaded cooperative FIFO executor.
///
/// Requires a Tokio runtime; the driver is a spawned task that alternates
/// one slice of the front job with a backpressure sleep.
#[derive(Clone, Default)]
pub struct CooperativeQueue {
    state: Arc<Mutex<QueueState>>,
}

impl CooperativeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job at the tail. A job may itself enqueue further work;
    /// it lands at the tail like any other submission.
    pub fn enqueue(&self, job: Box<dyn QueueJob>) {
        {
            let mut state = self.state.lock();
            debug!(target: "chronolithdb::queue", label = job.label(), queued = state.queued.len(), "enqueue");
            state.queued.push_back(job);
        }
        self.ensure_driver();
    }

    /// True while the executor is running and either a job is active or
    /// the backlog is at least four deep. Polled by callers as the
    /// backpressure signal; never raised as an error.
    pub fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state.running && (state.queued.len() >= BUSY_QUEUE_DEPTH || state.active)
    }

    /// Pending jobs, not counting the active one.
    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Drop all pending jobs. The active job, if any, runs to completion.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let dropped = state.queued.len();
        state.queued.clear();
        debug!(target: "chronolithdb::queue", dropped, "reset");
    }

    /// Drop all pending jobs and abandon the active one at its next yield.
    /// A job already inside a slice is never interrupted mid-slice.
    pub fn emergency_stop(&self) {
        let mut state = self.state.lock();
        let dropped = state.queued.len();
        state.queued.clear();
        if state.active {
            state.abandon_active = true;
        }
        debug!(target: "chronolithdb::queue", dropped, abandoning_active = state.active, "emergency stop");
    }

    /// Wait until the executor has gone idle (drained or stopped). Used by
    /// the engine's teardown order: drain the pipeline before close.
    pub async fn wait_idle(&self) {
        loop {
            if !self.state.lock().running {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn ensure_driver(&self) {
        let mut state = self.state.lock();
        if state.running {
            return;
        }
        state.running = true;
        drop(state);
        let shared = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut current: Option<Box<dyn QueueJob>> = None;
            loop {
                {
                    let mut state = shared.lock();
                    if state.abandon_active {
                        // Abandoned between slices: drop without another tick.
                        state.abandon_active = false;
                        state.active = false;
                        current = None;
                    }
                    if current.is_none() {
                        current = state.queued.pop_front();
                        state.active = current.is_some();
                        if current.is_none() {
                            state.running = false;
                            return;
                        }
                    }
                }
                let Some(job) = current.as_mut() else {
                    continue;
                };
                let deadline = Instant::now() + SLICE_BUDGET;
                let outcome = job.tick(deadline);
                trace!(target: "chronolithdb::queue", label = job.label(), ?outcome, "slice");
                let queued_len = {
                    let mut state = shared.lock();
                    match outcome {
                        SliceOutcome::Complete => {
                            current = None;
                            state.active = false;
                            state.abandon_active = false;
                        }
                        SliceOutcome::Yielded => {
                            if state.abandon_active {
                                state.abandon_active = false;
                                state.active = false;
                                current = None;
                            }
                        }
                    }
                    state.queued.len()
                };
                sleep(backpressure_delay(queued_len)).await;
            }
        });
    }
}
