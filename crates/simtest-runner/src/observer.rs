//! Notifications emitted while a session progresses.

use simtest_core::RunRecord;

use crate::plan::Run;

/// Receives run lifecycle notifications from the scheduler and the
/// supervisor. Calls come from worker tasks, possibly concurrently.
pub trait RunObserver: Send + Sync {
    fn on_start(&self, _run: &Run) {}

    /// One line of merged output, as it is produced.
    fn on_output_line(&self, _run: &Run, _line: &str) {}

    fn on_complete(&self, _run: &Run, _record: &RunRecord) {}

    /// A run settled without executing (skipped or excluded).
    fn on_bypass(&self, _record: &RunRecord) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}
