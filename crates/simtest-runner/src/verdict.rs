//! Session pass/fail evaluation and process exit codes.

use serde::{Deserialize, Serialize};
use simtest_core::StatsReport;

/// Exit code after an interrupt (128 + SIGINT).
pub const EXIT_INTERRUPTED: i32 = 130;

/// Outcome of a whole session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionVerdict {
    pub passed: bool,

    /// Reasons the session failed (empty if passed).
    pub violations: Vec<String>,

    pub message: String,

    pub interrupted: bool,
}

impl SessionVerdict {
    /// A session passes when no run failed and every definition loaded.
    pub fn evaluate(report: &StatsReport, interrupted: bool) -> Self {
        let mut violations: Vec<String> = report
            .failed_runs()
            .map(|run| format!("{} ({}) failed", run.test_name, run.config))
            .collect();
        for testset in &report.testsets {
            for (name, error) in testset.load_errors() {
                violations.push(format!("testset {name} failed to load: {error}"));
            }
        }
        if interrupted {
            violations.push("session interrupted".to_string());
        }

        let passed = violations.is_empty();
        let message = if passed {
            "All tests passed".to_string()
        } else {
            format!("Session failed with {} violation(s)", violations.len())
        };

        Self {
            passed,
            violations,
            message,
            interrupted,
        }
    }

    /// 130 after an interrupt; otherwise 1 on failure unless `no_fail`.
    pub fn exit_code(&self, no_fail: bool) -> i32 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else if self.passed || no_fail {
            0
        } else {
            1
        }
    }
}
