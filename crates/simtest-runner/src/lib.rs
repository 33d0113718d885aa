//! simtest runner
//!
//! Turns a loaded testset forest into runs and executes them:
//! - [`RunPlan`] expands (test, target) pairs and settles skipped and
//!   excluded runs up front
//! - [`Scheduler`] dispatches the rest to a worker pool behind a host
//!   load gate
//! - [`ProcessSupervisor`] runs each command with output capture, a
//!   deadline and process-tree termination

pub mod load;
pub mod metrics;
pub mod observer;
pub mod options;
pub mod plan;
pub mod scheduler;
pub mod supervisor;
pub mod verdict;

pub use load::{FixedLoadSensor, LoadGate, LoadSensor, LoadSample, SysinfoLoadSensor};
pub use metrics::SchedulerMetrics;
pub use observer::{NoopObserver, RunObserver};
pub use options::{RunnerOptions, DEFAULT_LOAD_AVERAGE, DEFAULT_PLATFORM};
pub use plan::{format_placeholders, Run, RunPlan, NOT_SELECTED, SKIPPED_FROM_COMMAND_LINE};
pub use scheduler::{ScheduleOutcome, Scheduler, DEFAULT_LOAD_BACKOFF};
pub use supervisor::{OutputBuffer, ProcessSupervisor, SupervisorError, DEFAULT_KILL_GRACE};
pub use verdict::{SessionVerdict, EXIT_INTERRUPTED};
