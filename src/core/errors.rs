//! Pipeline error taxonomy.
//!
//! Every stage-level failure is classified here, and `disposition` is the
//! single place that decides whether a failure ends the run or is logged and
//! absorbed.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::{ProjectStatus, SetupFailure, Stage};

/// Stage-level failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Generator output was malformed or out of bounds
    #[error("{0}")]
    Validation(String),

    /// A generator collaborator call failed
    #[error("{0}")]
    Generation(String),

    /// The workspace could not be materialized
    #[error("Workspace setup failed: {0}")]
    Io(String),

    /// The harness environment could not be prepared
    #[error("Dependency installation failed (exit code {})", exit_code_label(.exit_code))]
    DependencyInstall { exit_code: Option<i32> },

    /// The harness exited non-zero (results are still parsed)
    #[error("Test harness exited with code {}", exit_code_label(.0))]
    HarnessExecution(Option<i32>),

    #[error("{0}")]
    Publish(String),

    #[error("{0}")]
    Deploy(String),
}

/// What a failure means for the run as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The run moves to `failed`
    Fatal,
    /// The failure is logged and the run continues
    Recoverable,
}

impl PipelineError {
    /// Decide whether a failure at `stage` ends the run.
    ///
    /// Workspace and install failures abort only the current execution
    /// attempt: the zeroed result is still evaluated against the threshold.
    /// A failed regeneration during a retry keeps the pre-retry artifacts.
    pub fn disposition(&self, stage: Stage) -> Disposition {
        match (self, stage) {
            (Self::Generation(_) | Self::Validation(_), Stage::Retrying) => Disposition::Recoverable,
            (Self::Generation(_) | Self::Validation(_), _) => Disposition::Fatal,
            (Self::Io(_) | Self::DependencyInstall { .. }, _) => Disposition::Recoverable,
            (Self::HarnessExecution(_), _) => Disposition::Recoverable,
            (Self::Publish(_) | Self::Deploy(_), _) => Disposition::Recoverable,
        }
    }

}

/// `none` when the process was killed or never reported a code
fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

impl From<&SetupFailure> for PipelineError {
    fn from(failure: &SetupFailure) -> Self {
        match failure {
            SetupFailure::Workspace { message } => Self::Io(message.clone()),
            SetupFailure::DependencyInstall { exit_code } => Self::DependencyInstall {
                exit_code: *exit_code,
            },
        }
    }
}

/// Why `start` refused a request
#[derive(Debug, Error)]
pub enum StartError {
    #[error("Request must be at least {min} characters (got {actual})")]
    RequestTooShort { min: usize, actual: usize },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Why `cancel` refused a request
#[derive(Debug, Error)]
pub enum CancelError {
    #[error("Project not found: {0}")]
    NotFound(Uuid),

    #[error("Cannot cancel project in \"{0}\" state")]
    NotCancellable(ProjectStatus),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_is_fatal_outside_retry() {
        let err = PipelineError::Generation("rate limited".to_string());
        assert_eq!(err.disposition(Stage::Planning), Disposition::Fatal);
        assert_eq!(err.disposition(Stage::Building), Disposition::Fatal);
        assert_eq!(err.disposition(Stage::Testing), Disposition::Fatal);
        assert_eq!(err.disposition(Stage::Retrying), Disposition::Recoverable);
    }

    #[test]
    fn test_validation_is_fatal_outside_retry() {
        let err = PipelineError::Validation("no models".to_string());
        assert_eq!(err.disposition(Stage::Planning), Disposition::Fatal);
        assert_eq!(err.disposition(Stage::Retrying), Disposition::Recoverable);
    }

    #[test]
    fn test_non_blocking_categories() {
        let recoverable = [
            (PipelineError::Publish("403".into()), Stage::Publishing),
            (PipelineError::Deploy("timeout".into()), Stage::Deploying),
            (PipelineError::HarnessExecution(Some(1)), Stage::Testing),
            (PipelineError::DependencyInstall { exit_code: Some(1) }, Stage::Testing),
            (PipelineError::Io("disk full".into()), Stage::Testing),
        ];
        for (err, stage) in recoverable {
            assert_eq!(err.disposition(stage), Disposition::Recoverable, "{}", err);
        }
    }

    #[test]
    fn test_from_setup_failure() {
        let err = PipelineError::from(&SetupFailure::DependencyInstall { exit_code: Some(2) });
        assert_eq!(err, PipelineError::DependencyInstall { exit_code: Some(2) });
        assert_eq!(
            err.to_string(),
            "Dependency installation failed (exit code 2)"
        );
    }

    #[test]
    fn test_exit_codes_render_plainly() {
        assert_eq!(
            PipelineError::HarnessExecution(Some(1)).to_string(),
            "Test harness exited with code 1"
        );
        assert_eq!(
            PipelineError::HarnessExecution(None).to_string(),
            "Test harness exited with code none"
        );
        assert_eq!(
            PipelineError::DependencyInstall { exit_code: None }.to_string(),
            "Dependency installation failed (exit code none)"
        );
    }

    #[test]
    fn test_cancel_error_message() {
        let err = CancelError::NotCancellable(ProjectStatus::Completed);
        assert_eq!(err.to_string(), "Cannot cancel project in \"completed\" state");
    }
}
