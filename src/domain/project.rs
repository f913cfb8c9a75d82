//! Projects and their lifecycle status.
//!
//! A Project is one pipeline invocation. Its status only ever moves forward
//! through the stage sequence, and terminal states are never left.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::spec::AppSpec;
use super::test_result::TestResult;

/// Relative path -> file content
pub type FileSet = BTreeMap<String, String>;

/// Maximum length of a project label derived from the request
const NAME_MAX_CHARS: usize = 80;

/// One pipeline invocation and everything it produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,

    /// Human label derived from the request
    pub name: String,

    /// Original request text
    pub request: String,

    pub status: ProjectStatus,

    /// Free-text substage marker
    pub current_step: String,

    /// Planning output (None until planning completes)
    pub spec: Option<AppSpec>,

    /// Generated application files
    pub artifacts: Option<FileSet>,

    /// Generated test files
    pub test_artifacts: Option<FileSet>,

    /// Last test execution summary
    pub test_result: Option<TestResult>,

    /// Reference returned by the publish collaborator
    pub publish_ref: Option<String>,

    /// Reference returned by the deploy collaborator
    pub deploy_ref: Option<String>,

    /// Last error message
    pub error: Option<String>,

    pub retry_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Planning,
    Building,
    Testing,
    Retrying,
    Publishing,
    Deploying,
    Completed,
    CompletedWithWarnings,
    Failed,
    Cancelled,
}

impl ProjectStatus {
    /// Statuses a project never leaves
    pub const TERMINAL: [ProjectStatus; 4] = [
        ProjectStatus::Completed,
        ProjectStatus::CompletedWithWarnings,
        ProjectStatus::Failed,
        ProjectStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Building => "building",
            Self::Testing => "testing",
            Self::Retrying => "retrying",
            Self::Publishing => "publishing",
            Self::Deploying => "deploying",
            Self::Completed => "completed",
            Self::CompletedWithWarnings => "completed_with_warnings",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "building" => Ok(Self::Building),
            "testing" => Ok(Self::Testing),
            "retrying" => Ok(Self::Retrying),
            "publishing" => Ok(Self::Publishing),
            "deploying" => Ok(Self::Deploying),
            "completed" => Ok(Self::Completed),
            "completed_with_warnings" => Ok(Self::CompletedWithWarnings),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

/// A partial update applied to a project by one stage.
///
/// Only the fields that are `Some` are written.
#[derive(Debug, Clone, Default)]
pub struct ProjectUpdate {
    pub status: Option<ProjectStatus>,
    pub current_step: Option<String>,
    pub spec: Option<AppSpec>,
    pub artifacts: Option<FileSet>,
    pub test_artifacts: Option<FileSet>,
    pub test_result: Option<TestResult>,
    pub publish_ref: Option<String>,
    pub deploy_ref: Option<String>,
    pub error: Option<String>,
}

impl ProjectUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ProjectStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn spec(mut self, spec: AppSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn artifacts(mut self, files: FileSet) -> Self {
        self.artifacts = Some(files);
        self
    }

    pub fn test_artifacts(mut self, files: FileSet) -> Self {
        self.test_artifacts = Some(files);
        self
    }

    pub fn test_result(mut self, result: TestResult) -> Self {
        self.test_result = Some(result);
        self
    }

    pub fn publish_ref(mut self, reference: impl Into<String>) -> Self {
        self.publish_ref = Some(reference.into());
        self
    }

    pub fn deploy_ref(mut self, reference: impl Into<String>) -> Self {
        self.deploy_ref = Some(reference.into());
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }
}

/// Derive a project label from the request text
pub fn project_name(request: &str) -> String {
    request
        .chars()
        .take(NAME_MAX_CHARS)
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect::<String>()
        .trim()
        .to_string()
}
