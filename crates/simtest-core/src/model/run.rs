//! Run outcomes as handed to the statistics layer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stats::BenchmarkResult;

/// Terminal status of a run. Assigned once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
    Skipped,
    Excluded,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
            RunStatus::Excluded => "excluded",
        }
    }

    /// Whether the run went through the process supervisor.
    pub fn was_executed(&self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index path of a test inside the loaded forest: the testset indices from
/// the top level down, then the test's index in its testset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestLocation {
    pub testset_path: Vec<usize>,
    pub test_index: usize,
}

/// Read-only record of one finished (or bypassed) run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub location: TestLocation,
    pub test_name: String,
    pub target: String,
    pub config: String,
    pub status: RunStatus,

    /// Wall-clock duration in seconds.
    pub duration_secs: f64,

    /// Merged stdout/stderr of every command.
    pub output: String,

    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub truncated: bool,

    /// Skip/exclusion reason or failure detail.
    pub message: Option<String>,

    #[serde(default)]
    pub benchmarks: Vec<BenchmarkResult>,
}

impl RunRecord {
    /// Record for a run that never reached the supervisor.
    pub fn bypassed(
        run_id: String,
        location: TestLocation,
        test_name: &str,
        target: &str,
        config: &str,
        status: RunStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            location,
            test_name: test_name.to_string(),
            target: target.to_string(),
            config: config.to_string(),
            status,
            duration_secs: 0.0,
            output: String::new(),
            exit_code: None,
            timed_out: false,
            truncated: false,
            message: Some(message.into()),
            benchmarks: Vec::new(),
        }
    }
}
