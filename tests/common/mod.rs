//! Shared fixtures for orchestrator integration tests.
//!
//! The harness is `sh -c "cat result.txt"`: each generated artifact set
//! carries the summary line its test run will report, so pass rates are
//! decided by the fake generators.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Notify;
use uuid::Uuid;

use autoship::adapters::{
    ArtifactGenerator, Collaborators, Deployer, Publisher, SpecGenerator, TestGenerator,
};
use autoship::config::{PipelineSettings, SandboxSettings};
use autoship::core::{Orchestrator, ProjectStore};
use autoship::domain::{AppSpec, FileSet, PipelineEvent, Project};
use autoship::sandbox::Sandbox;

pub const POLL: Duration = Duration::from_millis(20);

pub const REQUEST: &str = "A todo app with tags and due dates";

pub fn valid_spec() -> AppSpec {
    serde_json::from_value(json!({
        "app_name": "todo_app",
        "display_name": "Todo App",
        "description": "Track todos",
        "models": [{
            "name": "Todo",
            "table_name": "todos",
            "fields": [{ "name": "title", "type": "string", "required": true }]
        }],
        "endpoints": [
            { "method": "GET", "path": "/api/todos", "model": "Todo", "operation": "read_all" },
            { "method": "POST", "path": "/api/todos", "model": "Todo", "operation": "create" }
        ]
    }))
    .unwrap()
}

/// Artifact set whose test run reports `summary`
pub fn artifacts(summary: &str) -> FileSet {
    let mut files = FileSet::new();
    files.insert("main.py".to_string(), "app = object()\n".to_string());
    files.insert("result.txt".to_string(), format!("{}\n", summary));
    files
}

pub fn test_files() -> FileSet {
    let mut files = FileSet::new();
    files.insert(
        "tests/test_main.py".to_string(),
        "def test_ok():\n    assert True\n".to_string(),
    );
    files
}

// ── Fake collaborators ────────────────────────────────────────────────

pub struct FakeSpec {
    pub spec: AppSpec,
    /// Planning blocks until notified
    pub gate: Option<Arc<Notify>>,
    /// Planning never returns
    pub hang: bool,
}

impl FakeSpec {
    pub fn returning(spec: AppSpec) -> Self {
        Self {
            spec,
            gate: None,
            hang: false,
        }
    }
}

#[async_trait]
impl SpecGenerator for FakeSpec {
    async fn generate(&self, _request: &str) -> Result<AppSpec> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(self.spec.clone())
    }
}

pub struct FakeArtifacts {
    pub first: Result<FileSet, String>,
    pub retry: Result<FileSet, String>,
    pub regenerations: AtomicU32,
}

impl FakeArtifacts {
    pub fn new(first: FileSet, retry: Result<FileSet, String>) -> Self {
        Self {
            first: Ok(first),
            retry,
            regenerations: AtomicU32::new(0),
        }
    }

    pub fn regenerations(&self) -> u32 {
        self.regenerations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactGenerator for FakeArtifacts {
    async fn generate(&self, _spec: &AppSpec) -> Result<FileSet> {
        self.first.clone().map_err(anyhow::Error::msg)
    }

    async fn regenerate(
        &self,
        _spec: &AppSpec,
        _prior: &FileSet,
        _failure_transcript: &str,
    ) -> Result<FileSet> {
        self.regenerations.fetch_add(1, Ordering::SeqCst);
        self.retry.clone().map_err(anyhow::Error::msg)
    }
}

pub struct FakeTests(pub FileSet);

#[async_trait]
impl TestGenerator for FakeTests {
    async fn generate(&self, _spec: &AppSpec, _artifacts: &FileSet) -> Result<FileSet> {
        Ok(self.0.clone())
    }
}

pub struct FakePublisher(pub Result<String, String>);

#[async_trait]
impl Publisher for FakePublisher {
    fn name(&self) -> &str {
        "fake"
    }

    async fn publish(&self, _name: &str, _description: &str, _files: &FileSet) -> Result<String> {
        self.0.clone().map_err(anyhow::Error::msg)
    }
}

pub struct FakeDeployer;

#[async_trait]
impl Deployer for FakeDeployer {
    fn name(&self) -> &str {
        "fake"
    }

    async fn deploy(&self, name: &str, _publish_ref: &str, _artifacts: &FileSet) -> Result<String> {
        Ok(format!("https://{}.example.test", name))
    }
}

// ── Harness ───────────────────────────────────────────────────────────

pub fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

pub fn sandbox_settings(workspaces: &Path) -> SandboxSettings {
    let mut settings = SandboxSettings::with_workspaces_dir(workspaces.to_path_buf());
    settings.install_command = Vec::new();
    settings.test_command = sh("cat result.txt");
    settings.install_timeout = Duration::from_secs(10);
    settings.test_timeout = Duration::from_secs(10);
    settings
}

pub fn pipeline_settings() -> PipelineSettings {
    PipelineSettings {
        progress_grace: Duration::from_secs(60),
        ..PipelineSettings::default()
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub workspaces: TempDir,
}

impl Harness {
    pub fn new(collaborators: Collaborators) -> Self {
        Self::with(collaborators, pipeline_settings(), |_| {})
    }

    pub fn with(
        collaborators: Collaborators,
        settings: PipelineSettings,
        tweak: impl FnOnce(&mut SandboxSettings),
    ) -> Self {
        let workspaces = TempDir::new().unwrap();
        let mut sandbox = sandbox_settings(workspaces.path());
        tweak(&mut sandbox);

        let orchestrator = Orchestrator::new(
            ProjectStore::open_in_memory().unwrap(),
            Sandbox::new(sandbox),
            collaborators,
            settings,
        );
        Self {
            orchestrator,
            workspaces,
        }
    }

    pub async fn start(&self) -> Uuid {
        self.orchestrator.start(REQUEST).await.unwrap().project_id
    }

    /// Wait for a terminal status and for the run task to exit
    pub async fn finish(&self, id: Uuid) -> Project {
        tokio::time::timeout(Duration::from_secs(20), async {
            let project = self.orchestrator.wait_until_terminal(id, POLL).await.unwrap();
            while self.orchestrator.is_running(id) {
                tokio::time::sleep(POLL).await;
            }
            project
        })
        .await
        .expect("run did not finish in time")
    }

    pub async fn events(&self, id: Uuid) -> Vec<PipelineEvent> {
        self.orchestrator.get_logs_since(id, 0).await.unwrap()
    }

    /// Number of entries left under the workspaces root
    pub fn leftover_workspaces(&self) -> usize {
        match std::fs::read_dir(self.workspaces.path()) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

pub fn collaborators(
    artifacts: Arc<FakeArtifacts>,
    publisher: Option<Arc<dyn Publisher>>,
    deployer: Option<Arc<dyn Deployer>>,
) -> Collaborators {
    Collaborators {
        spec: Arc::new(FakeSpec::returning(valid_spec())),
        artifacts,
        tests: Arc::new(FakeTests(test_files())),
        publisher,
        deployer,
    }
}
