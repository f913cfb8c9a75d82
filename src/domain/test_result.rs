//! Test execution results.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Aggregate counts parsed from a harness transcript
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub total: u32,
    /// Pass rate in [0, 100]
    pub percentage: u8,
}

impl TestCounts {
    /// Build counts from raw numbers, deriving total and percentage.
    ///
    /// The total saturates at `u32::MAX`.
    pub fn from_parts(passed: u32, failed: u32, errors: u32) -> Self {
        let total = passed.saturating_add(failed).saturating_add(errors);
        Self {
            passed,
            failed,
            errors,
            total,
            percentage: pass_percentage(passed, total),
        }
    }
}

/// `round(100 * passed / total)`, half rounding up; 0 when total is 0
pub fn pass_percentage(passed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let passed = u64::from(passed.min(total));
    let total = u64::from(total);
    ((200 * passed + total) / (2 * total)) as u8
}

/// Why an execution attempt stopped before the harness ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SetupFailure {
    /// Workspace could not be created or populated
    Workspace { message: String },

    /// Dependency install exited non-zero or timed out
    DependencyInstall { exit_code: Option<i32> },
}

/// Result of one test execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    #[serde(flatten)]
    pub counts: TestCounts,

    /// Raw harness (or install) transcript
    pub output: String,

    /// Workspace the attempt ran in
    pub workspace_path: Option<PathBuf>,

    /// Harness exit code, if the harness ran to completion
    pub exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_failure: Option<SetupFailure>,
}

impl TestResult {
    /// Zeroed result for an attempt that never reached the harness
    pub fn aborted(failure: SetupFailure, output: String, workspace_path: Option<PathBuf>) -> Self {
        Self {
            counts: TestCounts::default(),
            output,
            workspace_path,
            exit_code: None,
            setup_failure: Some(failure),
        }
    }

    pub fn percentage(&self) -> u8 {
        self.counts.percentage
    }

    /// Counts as an event payload
    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "passed": self.counts.passed,
            "failed": self.counts.failed,
            "errors": self.counts.errors,
            "total": self.counts.total,
            "percentage": self.counts.percentage,
        })
    }
}
