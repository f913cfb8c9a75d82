//! Domain types for the autoship pipeline.
//!
//! This module contains the core data structures:
//! - Project: One pipeline invocation and its lifecycle status
//! - Events: Append-only log entries
//! - Spec: Structured planning output
//! - TestResult: Outcome of a test execution attempt

pub mod events;
pub mod project;
pub mod spec;
pub mod test_result;

// Re-export commonly used types
pub use events::{EventStatus, NewEvent, PipelineEvent, Stage};
pub use project::{project_name, FileSet, Project, ProjectStatus, ProjectUpdate};
pub use spec::{AppSpec, EndpointDef, FieldDef, ModelDef, SpecLimits, SpecViolation};
pub use test_result::{pass_percentage, SetupFailure, TestCounts, TestResult};
