//! autoship - Pipeline orchestrator for generated applications
//!
//! Turns a natural-language request into a specification, application
//! code and a test suite, runs the tests in a disposable workspace, retries
//! once below the pass threshold, then optionally publishes and deploys.
//!
//! # Architecture
//!
//! Every run is a background task owned by the [`Orchestrator`]:
//! - Durable project state and an append-only event log live in SQLite
//! - Live progress lives in an in-memory registry
//! - Cancellation is cooperative and enforced by guarded status writes
//!
//! # Modules
//!
//! - `adapters`: External collaborators (LLM generators, GitHub, Railway)
//! - `core`: Orchestration logic (Orchestrator, ProjectStore, RunRegistry)
//! - `domain`: Data structures (Project, PipelineEvent, AppSpec, TestResult)
//! - `sandbox`: Workspace materialization and test execution
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Start a run and follow it
//! autoship run "A todo app with tags and due dates"
//!
//! # Check project status
//! autoship status <project-id>
//!
//! # Cancel a run
//! autoship cancel <project-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, ProjectStore, RunProgress, StatusView};
pub use domain::{EventStatus, PipelineEvent, Project, ProjectStatus, Stage, TestResult};
