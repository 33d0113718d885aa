//! Structured lifecycle events for test runs.
//!
//! Events are emitted with an `event` field so they can be filtered out of
//! JSON logs by name.

use std::path::Path;

use tracing::{info, warn};

use crate::model::RunStatus;

/// Span tagged with the run id, test and target. Attach it to the run's
/// future with `tracing::Instrument` so every event inside carries them.
pub fn run_span(run_id: &str, test: &str, target: &str) -> tracing::Span {
    tracing::info_span!("simtest.run", run_id = %run_id, test = %test, target = %target)
}

/// Logged when a worker starts executing a run.
pub fn emit_run_started(run_id: &str, test: &str, target: &str) {
    info!(event = "run.started", run_id = %run_id, test = %test, target = %target);
}

/// Logged once per executed run with its final status.
pub fn emit_run_finished(run_id: &str, status: RunStatus, duration_ms: u64, timed_out: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
        timed_out = timed_out,
    );
}

/// A run that was recorded without being executed.
pub fn emit_run_bypassed(run_id: &str, test: &str, status: RunStatus, reason: &str) {
    info!(event = "run.bypassed", run_id = %run_id, test = %test, status = %status, reason = %reason);
}

/// Logged when a definition file cannot be turned into a testset.
pub fn emit_load_failed(definition: &Path, error: &dyn std::fmt::Display) {
    warn!(event = "load.failed", definition = %definition.display(), error = %error);
}

/// Logged once when the scheduler returns.
pub fn emit_schedule_finished(executed: u64, bypassed: u64, cancelled: bool) {
    info!(
        event = "schedule.finished",
        executed = executed,
        bypassed = bypassed,
        cancelled = cancelled,
    );
}
