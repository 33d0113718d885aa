//! Atomic counters describing one scheduling session.
//!
//! Counters are bumped by worker tasks without locking. Call
//! [`SchedulerMetrics::flush`] at the end of a session to emit them as one
//! `info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Session counters shared by all workers.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    dispatched: AtomicU64,
    completed: AtomicU64,
    bypassed: AtomicU64,
    timed_out: AtomicU64,
    throttled_polls: AtomicU64,
}

impl SchedulerMetrics {
    pub const fn new() -> Self {
        Self {
            dispatched: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            bypassed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            throttled_polls: AtomicU64::new(0),
        }
    }

    /// A run was handed to a worker.
    pub fn inc_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "dispatched", "counter incremented");
    }

    /// A worker finished a run, whatever its status.
    pub fn inc_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// A run was recorded as skipped or excluded without executing.
    pub fn inc_bypassed(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    /// A run hit its deadline.
    pub fn inc_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// One dispatch attempt held back by the load gate.
    pub fn inc_throttled(&self) {
        self.throttled_polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs handed to workers so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn bypassed(&self) -> u64 {
        self.bypassed.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    /// Dispatch attempts delayed by the load gate.
    pub fn throttled(&self) -> u64 {
        self.throttled_polls.load(Ordering::Relaxed)
    }

    /// Emit every counter as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            dispatched = self.dispatched(),
            completed = self.completed(),
            bypassed = self.bypassed(),
            timed_out = self.timed_out(),
            throttled_polls = self.throttled(),
        );
    }
}
