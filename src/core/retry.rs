//! Domain-level retry policy.
//!
//! After the first full test execution, a run below the pass threshold gets
//! one regeneration attempt if the retry budget allows it. Test failure is
//! never fatal: the final status only distinguishes a clean completion from
//! a completion with warnings.

use crate::config::PipelineSettings;
use crate::domain::ProjectStatus;

/// At most one regeneration per run, whatever the configured budget
const MAX_RETRIES_PER_RUN: u32 = 1;

/// What to do after a test execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Result meets the threshold
    Accept,
    /// Regenerate artifacts and test again
    Retry,
    /// Below threshold but no retries left
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Minimum pass percentage
    pub threshold: u8,
    /// Configured retry budget
    pub budget: u32,
}

impl RetryPolicy {
    pub fn new(threshold: u8, budget: u32) -> Self {
        Self { threshold, budget }
    }

    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self::new(settings.test_threshold, settings.max_retries)
    }

    pub fn meets_threshold(&self, percentage: u8) -> bool {
        percentage >= self.threshold
    }

    /// Decide based on the latest pass percentage and retries already used
    pub fn decide(&self, percentage: u8, retries_used: u32) -> RetryDecision {
        if self.meets_threshold(percentage) {
            RetryDecision::Accept
        } else if retries_used < self.budget.min(MAX_RETRIES_PER_RUN) {
            RetryDecision::Retry
        } else {
            RetryDecision::Exhausted
        }
    }

    /// Terminal status for a run whose final pass percentage is known
    pub fn final_status(&self, percentage: u8) -> ProjectStatus {
        if self.meets_threshold(percentage) {
            ProjectStatus::Completed
        } else {
            ProjectStatus::CompletedWithWarnings
        }
    }
}
