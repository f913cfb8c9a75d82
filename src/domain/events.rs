//! Pipeline events for the append-only project log.
//!
//! Every stage transition is recorded as an immutable event. Ordering is the
//! event's sequence number (assigned by the store on insert), never the
//! timestamp, since several events can share a timestamp.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry in a project's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Strictly increasing sequence number, unique across all projects
    pub seq: i64,

    /// The project this event belongs to
    pub project_id: Uuid,

    /// Stage that reported the event
    pub stage: Stage,

    /// Status token reported by the stage
    pub status: EventStatus,

    /// Human-readable message (free text)
    pub message: String,

    /// Optional structured payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// When the event was recorded
    pub created_at: DateTime<Utc>,
}

/// An event that has not been assigned a sequence number yet.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub project_id: Uuid,
    pub stage: Stage,
    pub status: EventStatus,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl NewEvent {
    pub fn new(
        project_id: Uuid,
        stage: Stage,
        status: EventStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            project_id,
            stage,
            status,
            message: message.into(),
            data: None,
        }
    }

    /// Attach a structured payload
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Named phases of a run, as they appear in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    Building,
    Testing,
    Retrying,
    Publishing,
    Deploying,
    Completed,
    /// User-requested cancellation
    Cancellation,
    /// Synthetic stage for failures that escape every other stage
    Orchestrator,
}

impl Stage {
    /// Stages shown in a status summary, in pipeline order
    pub const SUMMARY_ORDER: [Stage; 7] = [
        Stage::Planning,
        Stage::Building,
        Stage::Testing,
        Stage::Retrying,
        Stage::Publishing,
        Stage::Deploying,
        Stage::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Building => "building",
            Self::Testing => "testing",
            Self::Retrying => "retrying",
            Self::Publishing => "publishing",
            Self::Deploying => "deploying",
            Self::Completed => "completed",
            Self::Cancellation => "cancellation",
            Self::Orchestrator => "orchestrator",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "building" => Ok(Self::Building),
            "testing" => Ok(Self::Testing),
            "retrying" => Ok(Self::Retrying),
            "publishing" => Ok(Self::Publishing),
            "deploying" => Ok(Self::Deploying),
            "completed" => Ok(Self::Completed),
            "cancellation" => Ok(Self::Cancellation),
            "orchestrator" => Ok(Self::Orchestrator),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

/// Status token attached to an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Stage began
    Started,

    /// Intermediate progress inside a stage
    Running,

    /// A test execution finished (results attached)
    Executed,

    /// Artifacts were regenerated during a retry
    Rebuilt,

    /// Regenerated artifacts were tested again
    Retested,

    /// Stage finished successfully
    Completed,

    /// Whole run finished
    Success,

    /// Optional stage did not run
    Skipped,

    /// Non-fatal failure (run continues)
    Failed,

    /// Fatal failure (run is over)
    Error,

    /// Run was cancelled
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Running => "running",
            Self::Executed => "executed",
            Self::Rebuilt => "rebuilt",
            Self::Retested => "retested",
            Self::Completed => "completed",
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "running" => Ok(Self::Running),
            "executed" => Ok(Self::Executed),
            "rebuilt" => Ok(Self::Rebuilt),
            "retested" => Ok(Self::Retested),
            "completed" => Ok(Self::Completed),
            "success" => Ok(Self::Success),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid event status: {}", s)),
        }
    }
}
