//! Core orchestration logic.
//!
//! This module contains:
//! - ProjectStore: Durable projects and the append-only event log
//! - RunRegistry: Volatile per-run progress
//! - RetryPolicy: Threshold and retry decisions
//! - Errors: Stage error taxonomy and its fatal/recoverable policy
//! - Orchestrator: Main execution engine

pub mod errors;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod store;

// Re-export commonly used types
pub use errors::{CancelError, Disposition, PipelineError, StartError};
pub use orchestrator::{Orchestrator, StageSummary, StartedRun, StatusView};
pub use registry::{RunProgress, RunRegistry};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{CancelOutcome, ProjectDb, ProjectStore, CANCELLED_BY_USER};
