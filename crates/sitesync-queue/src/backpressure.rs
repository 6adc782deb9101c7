//! Backpressure gate (spec §4.5): blocks new work while a run's `pending`
//! backlog is at or past the configured ceiling, "to prevent mass
//! pre-claiming that otherwise explodes `in_progress` and worsens lease
//! churn." The Executor consults it before leasing a new batch; the Worker
//! consults it before enqueueing newly-discovered links (spec §4.4 step 7:
//! "only after the backpressure gate permits").
//!
//! The gate must not count `in_progress` toward the ceiling: a worker's own
//! in-flight task counts as `in_progress` until that worker's `finish` call,
//! and `finish` only happens after `discover_links` clears this gate. Gating
//! on `pending + in_progress` lets every worker saturate the ceiling with
//! its own in-progress task and then wedge forever waiting for a backlog
//! that can only shrink via a `finish` none of them can reach — a deadlock,
//! not backpressure. Gating on `pending` alone still bounds how much
//! unclaimed backlog piles up, which is the actual goal.
//!
//! The gate polls [`Queue::counts`] rather than keeping its own in-process
//! tally, because the count has to survive reclamation and resume
//! transitions that happen deep inside the Store and are otherwise invisible
//! up here. Spec §5 explicitly allows this: "Observability counters
//! (`in_flight`, ...) may be eventually consistent; invariants do not depend
//! on them."

use crate::{Queue, QueueResult};
use std::time::Duration;
use tokio::sync::watch;

pub struct BackpressureGate {
    queue: Queue,
    max_in_flight: i64,
    poll_interval: Duration,
}

impl BackpressureGate {
    pub fn new(queue: Queue, max_in_flight: i64, poll_interval: Duration) -> Self {
        Self {
            queue,
            max_in_flight: max_in_flight.max(1),
            poll_interval,
        }
    }

    /// Blocks until `pending` for this run is below the ceiling. Returns
    /// `Ok(false)` without waiting further if cancellation is observed
    /// first, so callers can bail out of their own loop instead of
    /// acquiring or enqueueing anything.
    pub async fn wait(&self, cancel: &mut watch::Receiver<bool>) -> QueueResult<bool> {
        loop {
            let counts = self.queue.counts().await?;
            if counts.pending < self.max_in_flight {
                return Ok(true);
            }
            if *cancel.borrow() {
                return Ok(false);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.changed() => {}
            }
            if *cancel.borrow() {
                return Ok(false);
            }
        }
    }
}
