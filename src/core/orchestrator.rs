//! Main orchestrator for pipeline execution.
//!
//! Drives one project through the stage sequence:
//! `planning -> building -> testing -> [retrying] -> publishing -> deploying`
//! and owns terminal/failure semantics. Each run is a spawned task; `start`
//! returns as soon as the project row exists.
//!
//! Every status write goes through a guarded store update, so a project that
//! was cancelled (or failed) mid-stage is never advanced again. The run task
//! notices on its next transition and exits quietly. Terminal statuses are
//! written together with their closing event.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::Collaborators;
use crate::config::{PipelineSettings, ResolvedConfig};
use crate::domain::{
    project_name, AppSpec, EventStatus, FileSet, NewEvent, PipelineEvent, Project, ProjectStatus,
    ProjectUpdate, Stage, TestResult,
};
use crate::sandbox::{Execution, Sandbox};

use super::errors::{CancelError, Disposition, PipelineError, StartError};
use super::registry::{RunProgress, RunRegistry};
use super::retry::{RetryDecision, RetryPolicy};
use super::store::{CancelOutcome, ProjectStore};

/// Returned by `start`
#[derive(Debug, Clone, Serialize)]
pub struct StartedRun {
    pub project_id: Uuid,
    pub status: ProjectStatus,
}

/// Last known state of one stage, derived from the event log
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: Stage,
    /// Last event status token, or `pending`/`skipped` when the stage never ran
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Durable project state merged with live progress
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub project: Project,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<RunProgress>,
    pub stages: Vec<StageSummary>,
}

/// Per-run handle passed between stages
struct Run {
    id: Uuid,
    token: CancellationToken,
}

/// What the testing stages hand to publishing
struct Tested {
    artifacts: FileSet,
    tests: FileSet,
    result: TestResult,
}

/// Main pipeline orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: ProjectStore,
    registry: RunRegistry,
    sandbox: Sandbox,
    collaborators: Collaborators,
    settings: PipelineSettings,
    policy: RetryPolicy,
    tokens: DashMap<Uuid, CancellationToken>,
}

impl Orchestrator {
    pub fn new(
        store: ProjectStore,
        sandbox: Sandbox,
        collaborators: Collaborators,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                registry: RunRegistry::new(),
                sandbox,
                collaborators,
                policy: RetryPolicy::from_settings(&settings),
                settings,
                tokens: DashMap::new(),
            }),
        }
    }

    /// Build an orchestrator from resolved configuration
    pub fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let store = ProjectStore::open(&config.database_path)?;
        let collaborators = Collaborators::from_config(config)?;
        Ok(Self::new(
            store,
            Sandbox::new(config.sandbox.clone()),
            collaborators,
            config.pipeline.clone(),
        ))
    }

    pub fn store(&self) -> &ProjectStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.inner.registry
    }

    // ── Public surface ────────────────────────────────────────────────

    /// Create a project and launch its run in the background
    #[instrument(skip(self, request))]
    pub async fn start(&self, request: &str) -> Result<StartedRun, StartError> {
        let request = request.trim();
        let actual = request.chars().count();
        if actual < self.inner.settings.min_request_chars {
            return Err(StartError::RequestTooShort {
                min: self.inner.settings.min_request_chars,
                actual,
            });
        }

        let id = Uuid::new_v4();
        let project = self
            .inner
            .store
            .create_project(id, project_name(request), request.to_string())
            .await?;

        self.inner.registry.set_progress(id, "queued", 0);
        let token = CancellationToken::new();
        self.inner.tokens.insert(id, token.clone());

        info!(project_id = %id, name = %project.name, "Run started");

        let this = self.clone();
        let request = request.to_string();
        tokio::spawn(async move {
            let worker = this.clone();
            let run = Run { id, token };
            let handle = tokio::spawn(async move { worker.run(&run, &request).await });

            let outcome = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(join_err) => Some(format!("Run task aborted: {}", join_err)),
            };
            match outcome {
                Some(message) => this.fatal(id, &message).await,
                None => this
                    .inner
                    .registry
                    .expire_after(id, this.inner.settings.progress_grace),
            }
            this.inner.tokens.remove(&id);
        });

        Ok(StartedRun {
            project_id: id,
            status: project.status,
        })
    }

    /// Cancel a non-terminal project.
    ///
    /// Cooperative: in-flight collaborator calls and subprocesses finish, but
    /// no later stage runs.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<(), CancelError> {
        match self.inner.store.cancel(id).await? {
            CancelOutcome::Cancelled => {
                if let Some(token) = self.inner.tokens.get(&id) {
                    token.cancel();
                }

                let registry = &self.inner.registry;
                if let Some(live) = registry.get(id) {
                    registry.settle(id, "cancelled", live.progress);
                    registry.expire_after(id, self.inner.settings.progress_grace);
                }

                info!(project_id = %id, "Run cancelled");
                Ok(())
            }
            CancelOutcome::NotFound => Err(CancelError::NotFound(id)),
            CancelOutcome::AlreadyTerminal(status) => Err(CancelError::NotCancellable(status)),
        }
    }

    /// Current project state merged with live progress and a per-stage summary
    pub async fn get_status(&self, id: Uuid) -> Result<Option<StatusView>> {
        let Some(project) = self.inner.store.get_project(id).await? else {
            return Ok(None);
        };
        let events = self.inner.store.events_since(id, 0).await?;
        let stages = summarize_stages(&events, project.status);

        Ok(Some(StatusView {
            live: self.inner.registry.get(id),
            project,
            stages,
        }))
    }

    pub fn list_active(&self) -> HashMap<Uuid, RunProgress> {
        self.inner.registry.list_active()
    }

    /// Whether this process still has a task working on the run.
    ///
    /// Stays true for a moment after the project turns terminal, while the
    /// task releases its workspace and settles live progress.
    pub fn is_running(&self, id: Uuid) -> bool {
        self.inner.tokens.contains_key(&id)
    }

    /// Events with `seq > cursor`, in insertion order
    pub async fn get_logs_since(&self, id: Uuid, cursor: i64) -> Result<Vec<PipelineEvent>> {
        self.inner.store.events_since(id, cursor).await
    }

    /// Poll until the project reaches a terminal status
    pub async fn wait_until_terminal(&self, id: Uuid, poll: Duration) -> Result<Project> {
        loop {
            let project = self
                .inner
                .store
                .get_project(id)
                .await?
                .with_context(|| format!("Project not found: {}", id))?;
            if project.status.is_terminal() {
                return Ok(project);
            }
            tokio::time::sleep(poll).await;
        }
    }

    // ── Stage sequence ────────────────────────────────────────────────

    /// Errors returned here are infrastructure failures; stage failures are
    /// handled inside.
    #[instrument(skip(self, run, request), fields(project_id = %run.id))]
    async fn run(&self, run: &Run, request: &str) -> Result<()> {
        let Some(spec) = self.plan(run, request).await? else {
            return Ok(());
        };
        let Some(artifacts) = self.build(run, &spec).await? else {
            return Ok(());
        };
        let Some(tested) = self.test(run, &spec, artifacts).await? else {
            return Ok(());
        };

        let Some(publish_ref) = self.publish(run, &spec, &tested).await? else {
            return Ok(());
        };
        let Some(deploy_ref) = self
            .deploy(run, &spec, publish_ref.as_deref(), &tested.artifacts)
            .await?
        else {
            return Ok(());
        };

        self.complete(run, &tested.result, publish_ref, deploy_ref)
            .await
    }

    async fn plan(&self, run: &Run, request: &str) -> Result<Option<AppSpec>> {
        if !self
            .enter(run, Some(ProjectStatus::Planning), "planning", 10)
            .await?
        {
            return Ok(None);
        }
        self.log(
            run.id,
            Stage::Planning,
            EventStatus::Started,
            "Generating specification",
            None,
        )
        .await?;

        let spec = match self
            .call(self.inner.collaborators.spec.generate(request))
            .await
        {
            Ok(spec) => spec,
            Err(message) => {
                self.fail(run, Stage::Planning, &PipelineError::Generation(message))
                    .await?;
                return Ok(None);
            }
        };

        if let Err(violation) = spec.validate(&self.inner.settings.spec_limits) {
            let err = PipelineError::Validation(violation.to_string());
            self.fail(run, Stage::Planning, &err).await?;
            return Ok(None);
        }

        if !self
            .record(run, ProjectUpdate::new().spec(spec.clone()).step("planning_done"), 25)
            .await?
        {
            return Ok(None);
        }
        self.log(
            run.id,
            Stage::Planning,
            EventStatus::Completed,
            format!("Spec: {}", spec.summary()),
            Some(serde_json::to_value(&spec)?),
        )
        .await?;

        Ok(Some(spec))
    }

    async fn build(&self, run: &Run, spec: &AppSpec) -> Result<Option<FileSet>> {
        if !self
            .enter(run, Some(ProjectStatus::Building), "building", 30)
            .await?
        {
            return Ok(None);
        }
        self.log(
            run.id,
            Stage::Building,
            EventStatus::Started,
            "Generating application code",
            None,
        )
        .await?;

        let generated = self
            .call(self.inner.collaborators.artifacts.generate(spec))
            .await;
        let Some(artifacts) = self
            .generated_files(run, Stage::Building, generated, "Artifact generator returned no files")
            .await?
        else {
            return Ok(None);
        };

        if !self
            .record(
                run,
                ProjectUpdate::new()
                    .artifacts(artifacts.clone())
                    .step("building_done"),
                50,
            )
            .await?
        {
            return Ok(None);
        }
        self.log(
            run.id,
            Stage::Building,
            EventStatus::Completed,
            format!("Generated {} files", artifacts.len()),
            Some(json!(artifacts.keys().collect::<Vec<_>>())),
        )
        .await?;

        Ok(Some(artifacts))
    }

    /// Generate tests, execute them, and run the retry loop
    async fn test(&self, run: &Run, spec: &AppSpec, artifacts: FileSet) -> Result<Option<Tested>> {
        if !self
            .enter(run, Some(ProjectStatus::Testing), "testing", 55)
            .await?
        {
            return Ok(None);
        }
        self.log(
            run.id,
            Stage::Testing,
            EventStatus::Started,
            "Generating tests",
            None,
        )
        .await?;

        let generated = self
            .call(self.inner.collaborators.tests.generate(spec, &artifacts))
            .await;
        let Some(tests) = self
            .generated_files(run, Stage::Testing, generated, "Test generator returned no files")
            .await?
        else {
            return Ok(None);
        };

        if !self
            .record(run, ProjectUpdate::new().test_artifacts(tests.clone()), 55)
            .await?
        {
            return Ok(None);
        }
        self.log(
            run.id,
            Stage::Testing,
            EventStatus::Running,
            format!("Generated {} test file(s), executing", tests.len()),
            Some(json!(tests.keys().collect::<Vec<_>>())),
        )
        .await?;

        if !self.enter(run, None, "executing_tests", 60).await? {
            return Ok(None);
        }
        let mut execution = self.inner.sandbox.execute(&artifacts, &tests).await;
        if !self.absorb_setup_failure(run, Stage::Testing, &execution).await? {
            return Ok(None);
        }
        if !self
            .record(
                run,
                ProjectUpdate::new()
                    .test_result(execution.result.clone())
                    .step("tests_done"),
                70,
            )
            .await?
        {
            return Ok(None);
        }
        self.log(
            run.id,
            Stage::Testing,
            EventStatus::Executed,
            results_message("Results", &execution.result),
            Some(result_data(&execution.result)),
        )
        .await?;

        let mut artifacts = artifacts;
        let policy = self.inner.policy;
        if policy.decide(execution.result.percentage(), 0) == RetryDecision::Retry {
            match self
                .retry(run, spec, &artifacts, &tests, execution)
                .await?
            {
                Some((new_artifacts, new_execution)) => {
                    if let Some(files) = new_artifacts {
                        artifacts = files;
                    }
                    execution = new_execution;
                }
                None => return Ok(None),
            }
        }

        let Execution { result, workspace } = execution;
        workspace.release().await;

        if !self.record(run, ProjectUpdate::new().step("tests_complete"), 80).await? {
            return Ok(None);
        }
        self.log(
            run.id,
            Stage::Testing,
            EventStatus::Completed,
            format!("Final test rate: {}%", result.percentage()),
            None,
        )
        .await?;

        Ok(Some(Tested {
            artifacts,
            tests,
            result,
        }))
    }

    /// One regeneration attempt.
    ///
    /// Returns the replacement artifacts (None when regeneration failed and
    /// the previous files stand) plus the execution to evaluate.
    async fn retry(
        &self,
        run: &Run,
        spec: &AppSpec,
        artifacts: &FileSet,
        tests: &FileSet,
        previous: Execution,
    ) -> Result<Option<(Option<FileSet>, Execution)>> {
        let threshold = self.inner.policy.threshold;
        let first = previous.result.percentage();

        if !self
            .enter(run, Some(ProjectStatus::Retrying), "retrying", 72)
            .await?
        {
            return Ok(None);
        }
        let retries = self.inner.store.increment_retry(run.id).await?;
        info!(project_id = %run.id, percentage = first, threshold, ?retries, "Below threshold, retrying");
        self.log(
            run.id,
            Stage::Retrying,
            EventStatus::Started,
            format!(
                "Tests at {}% (threshold: {}%). Regenerating application code",
                first, threshold
            ),
            None,
        )
        .await?;

        let regenerated = self
            .call(
                self.inner
                    .collaborators
                    .artifacts
                    .regenerate(spec, artifacts, &previous.result.output),
            )
            .await;
        let regenerated = match regenerated {
            Ok(files) if files.is_empty() => Err(PipelineError::Validation(
                "Artifact generator returned no files".to_string(),
            )),
            Ok(files) => Ok(files),
            Err(message) => Err(PipelineError::Generation(message)),
        };

        let (replacement, execution) = match regenerated {
            Ok(files) => {
                previous.workspace.release().await;

                if !self
                    .record(run, ProjectUpdate::new().artifacts(files.clone()), 75)
                    .await?
                {
                    return Ok(None);
                }
                self.log(
                    run.id,
                    Stage::Retrying,
                    EventStatus::Rebuilt,
                    format!("Regenerated {} files", files.len()),
                    Some(json!(files.keys().collect::<Vec<_>>())),
                )
                .await?;

                if !self.enter(run, None, "retesting", 78).await? {
                    return Ok(None);
                }
                let execution = self.inner.sandbox.execute(&files, tests).await;
                if !self.absorb_setup_failure(run, Stage::Retrying, &execution).await? {
                    return Ok(None);
                }
                if !self
                    .record(
                        run,
                        ProjectUpdate::new().test_result(execution.result.clone()),
                        78,
                    )
                    .await?
                {
                    return Ok(None);
                }
                self.log(
                    run.id,
                    Stage::Retrying,
                    EventStatus::Retested,
                    results_message("Retry", &execution.result),
                    Some(result_data(&execution.result)),
                )
                .await?;

                (Some(files), execution)
            }
            Err(err) => {
                if !self
                    .absorb(run, Stage::Retrying, &err, "Retry failed, continuing with previous code")
                    .await?
                {
                    return Ok(None);
                }
                (None, previous)
            }
        };

        let last = execution.result.percentage();
        if !self.inner.policy.meets_threshold(last) {
            self.log(
                run.id,
                Stage::Retrying,
                EventStatus::Failed,
                format!(
                    "Tests still below threshold after retry: {}% < {}%",
                    last, threshold
                ),
                None,
            )
            .await?;
        }

        Ok(Some((replacement, execution)))
    }

    /// Returns `Some(reference)` to continue (the inner option is the publish
    /// reference, if any), `None` when the run stopped.
    async fn publish(
        &self,
        run: &Run,
        spec: &AppSpec,
        tested: &Tested,
    ) -> Result<Option<Option<String>>> {
        let Some(publisher) = self.inner.collaborators.publisher.clone() else {
            if !self.enter(run, None, "publishing_done", 88).await? {
                return Ok(None);
            }
            self.log(
                run.id,
                Stage::Publishing,
                EventStatus::Skipped,
                "No publisher configured",
                None,
            )
            .await?;
            return Ok(Some(None));
        };

        if !self
            .enter(run, Some(ProjectStatus::Publishing), "publishing", 85)
            .await?
        {
            return Ok(None);
        }
        self.log(
            run.id,
            Stage::Publishing,
            EventStatus::Started,
            format!("Publishing via {}", publisher.name()),
            None,
        )
        .await?;

        let mut files = tested.artifacts.clone();
        files.extend(tested.tests.iter().map(|(k, v)| (k.clone(), v.clone())));
        let description = if spec.description.is_empty() {
            spec.display_name.as_str()
        } else {
            spec.description.as_str()
        };

        let published = self
            .call(publisher.publish(&spec.app_name, description, &files))
            .await;

        let reference = match published {
            Ok(reference) => {
                if !self
                    .record(
                        run,
                        ProjectUpdate::new()
                            .publish_ref(reference.clone())
                            .step("publishing_done"),
                        88,
                    )
                    .await?
                {
                    return Ok(None);
                }
                self.log(
                    run.id,
                    Stage::Publishing,
                    EventStatus::Completed,
                    format!("Published: {}", reference),
                    None,
                )
                .await?;
                Some(reference)
            }
            Err(message) => {
                if !self
                    .absorb(
                        run,
                        Stage::Publishing,
                        &PipelineError::Publish(message),
                        "Publish failed (non-blocking)",
                    )
                    .await?
                {
                    return Ok(None);
                }
                None
            }
        };

        Ok(Some(reference))
    }

    async fn deploy(
        &self,
        run: &Run,
        spec: &AppSpec,
        publish_ref: Option<&str>,
        artifacts: &FileSet,
    ) -> Result<Option<Option<String>>> {
        let (deployer, publish_ref) =
            match (self.inner.collaborators.deployer.clone(), publish_ref) {
                (Some(deployer), Some(reference)) => (deployer, reference),
                (deployer, _) => {
                    if !self.enter(run, None, "deploying_done", 95).await? {
                        return Ok(None);
                    }
                    let reason = if deployer.is_none() {
                        "No deployer configured"
                    } else {
                        "No publish reference to deploy"
                    };
                    self.log(run.id, Stage::Deploying, EventStatus::Skipped, reason, None)
                        .await?;
                    return Ok(Some(None));
                }
            };

        if !self
            .enter(run, Some(ProjectStatus::Deploying), "deploying", 90)
            .await?
        {
            return Ok(None);
        }
        self.log(
            run.id,
            Stage::Deploying,
            EventStatus::Started,
            format!("Deploying via {}", deployer.name()),
            None,
        )
        .await?;

        let deployed = self
            .call(deployer.deploy(&spec.app_name, publish_ref, artifacts))
            .await;

        let reference = match deployed {
            Ok(reference) => {
                if !self
                    .record(
                        run,
                        ProjectUpdate::new()
                            .deploy_ref(reference.clone())
                            .step("deploying_done"),
                        95,
                    )
                    .await?
                {
                    return Ok(None);
                }
                self.log(
                    run.id,
                    Stage::Deploying,
                    EventStatus::Completed,
                    format!("Deployed to: {}", reference),
                    None,
                )
                .await?;
                Some(reference)
            }
            Err(message) => {
                if !self
                    .absorb(
                        run,
                        Stage::Deploying,
                        &PipelineError::Deploy(message),
                        "Deployment failed (non-blocking)",
                    )
                    .await?
                {
                    return Ok(None);
                }
                None
            }
        };

        Ok(Some(reference))
    }

    async fn complete(
        &self,
        run: &Run,
        result: &TestResult,
        publish_ref: Option<String>,
        deploy_ref: Option<String>,
    ) -> Result<()> {
        if run.token.is_cancelled() {
            return Ok(());
        }

        let status = self.inner.policy.final_status(result.percentage());
        let closing = NewEvent::new(
            run.id,
            Stage::Completed,
            EventStatus::Success,
            "Pipeline completed",
        )
        .with_data(json!({
            "status": status,
            "test_pass_rate": result.percentage(),
            "publish_ref": publish_ref,
            "deploy_ref": deploy_ref,
        }));
        let written = self
            .inner
            .store
            .transition(run.id, ProjectUpdate::new().status(status).step("done"), closing)
            .await?;
        if written.is_none() {
            return Ok(());
        }
        self.inner.registry.settle(run.id, "done", 100);

        info!(project_id = %run.id, %status, "Run finished");
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────

    /// Begin a stage or substage. Returns false when the run must stop.
    async fn enter(
        &self,
        run: &Run,
        status: Option<ProjectStatus>,
        step: &str,
        progress: u8,
    ) -> Result<bool> {
        let mut update = ProjectUpdate::new().step(step);
        update.status = status;
        self.record(run, update, progress).await
    }

    /// Guarded project write plus registry update. Returns false when the
    /// project is already terminal or the run was cancelled.
    async fn record(&self, run: &Run, update: ProjectUpdate, progress: u8) -> Result<bool> {
        if run.token.is_cancelled() {
            return Ok(false);
        }
        let step = update.current_step.clone();
        if !self.inner.store.advance(run.id, update).await? {
            info!(project_id = %run.id, "Project is terminal, stopping run");
            return Ok(false);
        }
        // A cancel may have landed while the write was in flight
        if run.token.is_cancelled() {
            return Ok(false);
        }
        if let Some(step) = step {
            self.inner.registry.set_progress(run.id, step, progress);
        }
        Ok(true)
    }

    /// Append a stage event. Returns false when the project is already
    /// terminal and the event was dropped.
    async fn log(
        &self,
        id: Uuid,
        stage: Stage,
        status: EventStatus,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<bool> {
        let event = NewEvent::new(id, stage, status, message);
        let event = match data {
            Some(data) => event.with_data(data),
            None => event,
        };
        Ok(self.inner.store.append_event(event).await?.is_some())
    }

    /// Await a collaborator call under the configured timeout
    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T, String> {
        let limit = self.inner.settings.collaborator_timeout;
        match tokio::time::timeout(limit, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!("Timed out after {}s", limit.as_secs())),
        }
    }

    /// Check a generator's file set; empty output is a validation failure
    async fn generated_files(
        &self,
        run: &Run,
        stage: Stage,
        generated: Result<FileSet, String>,
        empty_message: &str,
    ) -> Result<Option<FileSet>> {
        let err = match generated {
            Ok(files) if !files.is_empty() => return Ok(Some(files)),
            Ok(_) => PipelineError::Validation(empty_message.to_string()),
            Err(message) => PipelineError::Generation(message),
        };
        self.fail(run, stage, &err).await?;
        Ok(None)
    }

    /// Route a setup failure through the error policy
    async fn absorb_setup_failure(&self, run: &Run, stage: Stage, execution: &Execution) -> Result<bool> {
        match &execution.result.setup_failure {
            Some(failure) => {
                self.absorb(run, stage, &PipelineError::from(failure), "Test execution aborted")
                    .await
            }
            None => Ok(true),
        }
    }

    /// Apply the error policy. Returns false when the run was failed.
    async fn absorb(
        &self,
        run: &Run,
        stage: Stage,
        err: &PipelineError,
        context: &str,
    ) -> Result<bool> {
        match err.disposition(stage) {
            Disposition::Fatal => {
                self.fail(run, stage, err).await?;
                Ok(false)
            }
            Disposition::Recoverable => {
                warn!(project_id = %run.id, %stage, error = %err, "{}", context);
                self.log(
                    run.id,
                    stage,
                    EventStatus::Failed,
                    format!("{}: {}", context, err),
                    None,
                )
                .await?;
                Ok(true)
            }
        }
    }

    /// Move the project to `failed` at `stage`
    async fn fail(&self, run: &Run, stage: Stage, err: &PipelineError) -> Result<()> {
        let message = err.to_string();
        let update = ProjectUpdate::new()
            .status(ProjectStatus::Failed)
            .step(stage.as_str())
            .error(message.clone());
        let closing = NewEvent::new(
            run.id,
            stage,
            EventStatus::Error,
            format!("Pipeline failed: {}", message),
        );
        if self.inner.store.transition(run.id, update, closing).await?.is_none() {
            return Ok(());
        }

        error!(project_id = %run.id, %stage, error = %message, "Run failed");
        self.inner.registry.set_error(run.id, "failed", message.as_str());
        Ok(())
    }

    /// Catch-all for failures that escaped every stage
    async fn fatal(&self, id: Uuid, message: &str) {
        error!(project_id = %id, error = %message, "Fatal pipeline error");
        self.inner.registry.remove(id);

        let update = ProjectUpdate::new()
            .status(ProjectStatus::Failed)
            .step("fatal_error")
            .error(message);
        let closing = NewEvent::new(
            id,
            Stage::Orchestrator,
            EventStatus::Error,
            format!("Fatal pipeline error: {}", message),
        );
        if let Err(e) = self.inner.store.transition(id, update, closing).await {
            error!(project_id = %id, error = %e, "Failed to mark project failed");
        }
    }
}

fn results_message(label: &str, result: &TestResult) -> String {
    format!(
        "{}: {}/{} passed ({}%)",
        label,
        result.counts.passed,
        result.counts.total,
        result.percentage()
    )
}

/// Event payload for a test execution
fn result_data(result: &TestResult) -> Value {
    let mut data = result.summary_json();
    if let Some(map) = data.as_object_mut() {
        if let Some(failure) = &result.setup_failure {
            map.insert("setup_failure".to_string(), json!(failure));
        } else if result.exit_code != Some(0) {
            let harness = PipelineError::HarnessExecution(result.exit_code);
            map.insert("harness_error".to_string(), json!(harness.to_string()));
        }
    }
    data
}

/// Per-stage view of the event log
fn summarize_stages(events: &[PipelineEvent], status: ProjectStatus) -> Vec<StageSummary> {
    Stage::SUMMARY_ORDER
        .iter()
        .map(|&stage| match events.iter().rev().find(|e| e.stage == stage) {
            Some(event) => StageSummary {
                stage,
                status: event.status.to_string(),
                message: Some(event.message.clone()),
            },
            None => StageSummary {
                stage,
                status: if status == ProjectStatus::Failed {
                    "skipped".to_string()
                } else {
                    "pending".to_string()
                },
                message: None,
            },
        })
        .collect()
}
