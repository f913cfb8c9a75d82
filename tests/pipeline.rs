//! Pipeline Integration Tests
//!
//! End-to-end runs through the orchestrator with fake generators and a
//! shell-scripted test harness.

mod common;

use std::sync::Arc;
use std::time::Duration;

use autoship::adapters::{Deployer, Publisher};
use autoship::config::PipelineSettings;
use autoship::domain::{EventStatus, ProjectStatus, Stage};

use common::*;

fn stage_events(
    events: &[autoship::domain::PipelineEvent],
    stage: Stage,
) -> Vec<(EventStatus, String)> {
    events
        .iter()
        .filter(|e| e.stage == stage)
        .map(|e| (e.status, e.message.clone()))
        .collect()
}

#[tokio::test]
async fn test_clean_run_completes_without_retry() {
    let artifacts = Arc::new(FakeArtifacts::new(
        artifacts("9 passed, 1 failed"),
        Ok(artifacts("10 passed")),
    ));
    let harness = Harness::new(collaborators(artifacts.clone(), None, None));

    let id = harness.start().await;
    let project = harness.finish(id).await;

    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(project.current_step, "done");
    assert_eq!(project.retry_count, 0);
    assert_eq!(project.test_result.as_ref().unwrap().percentage(), 90);
    assert_eq!(project.spec.as_ref().unwrap().app_name, "todo_app");
    assert_eq!(artifacts.regenerations(), 0);

    let events = harness.events(id).await;
    assert!(stage_events(&events, Stage::Retrying).is_empty());
    assert!(stage_events(&events, Stage::Testing)
        .iter()
        .any(|(status, msg)| *status == EventStatus::Executed && msg == "Results: 9/10 passed (90%)"));

    let last = events.last().unwrap();
    assert_eq!(last.stage, Stage::Completed);
    assert_eq!(last.status, EventStatus::Success);
    assert_eq!(last.message, "Pipeline completed");
}

#[tokio::test]
async fn test_below_threshold_retries_once_and_completes() {
    let artifacts = Arc::new(FakeArtifacts::new(
        artifacts("6 passed, 2 failed"),
        Ok(artifacts("9 passed, 1 failed")),
    ));
    let harness = Harness::new(collaborators(artifacts.clone(), None, None));

    let id = harness.start().await;
    let project = harness.finish(id).await;

    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(project.retry_count, 1);
    assert_eq!(artifacts.regenerations(), 1);
    assert_eq!(project.test_result.as_ref().unwrap().percentage(), 90);
    assert!(project.artifacts.as_ref().unwrap()["result.txt"].contains("9 passed"));

    let events = harness.events(id).await;
    let retrying = stage_events(&events, Stage::Retrying);
    let statuses: Vec<EventStatus> = retrying.iter().map(|(s, _)| *s).collect();
    assert_eq!(
        statuses,
        vec![EventStatus::Started, EventStatus::Rebuilt, EventStatus::Retested]
    );
    assert_eq!(
        retrying[0].1,
        "Tests at 75% (threshold: 80%). Regenerating application code"
    );
    assert_eq!(retrying[2].1, "Retry: 9/10 passed (90%)");
}

#[tokio::test]
async fn test_still_below_threshold_after_retry_warns() {
    let artifacts = Arc::new(FakeArtifacts::new(
        artifacts("6 passed, 2 failed"),
        Ok(artifacts("7 passed, 3 failed")),
    ));
    let harness = Harness::new(collaborators(artifacts.clone(), None, None));

    let id = harness.start().await;
    let project = harness.finish(id).await;

    assert_eq!(project.status, ProjectStatus::CompletedWithWarnings);
    assert_eq!(project.retry_count, 1);
    assert_eq!(artifacts.regenerations(), 1);

    let events = harness.events(id).await;
    assert!(stage_events(&events, Stage::Retrying).iter().any(|(status, msg)| {
        *status == EventStatus::Failed
            && msg == "Tests still below threshold after retry: 70% < 80%"
    }));
}

#[tokio::test]
async fn test_zero_retry_budget_skips_retry() {
    let artifacts = Arc::new(FakeArtifacts::new(
        artifacts("6 passed, 2 failed"),
        Ok(artifacts("10 passed")),
    ));
    let settings = PipelineSettings {
        max_retries: 0,
        ..pipeline_settings()
    };
    let harness = Harness::with(collaborators(artifacts.clone(), None, None), settings, |_| {});

    let id = harness.start().await;
    let project = harness.finish(id).await;

    assert_eq!(project.status, ProjectStatus::CompletedWithWarnings);
    assert_eq!(project.retry_count, 0);
    assert_eq!(artifacts.regenerations(), 0);
    assert!(stage_events(&harness.events(id).await, Stage::Retrying).is_empty());
}

#[tokio::test]
async fn test_retry_generation_failure_keeps_previous_artifacts() {
    let artifacts = Arc::new(FakeArtifacts::new(
        artifacts("6 passed, 2 failed"),
        Err("model overloaded".to_string()),
    ));
    let harness = Harness::new(collaborators(artifacts.clone(), None, None));

    let id = harness.start().await;
    let project = harness.finish(id).await;

    assert_eq!(project.status, ProjectStatus::CompletedWithWarnings);
    assert_eq!(project.retry_count, 1);
    assert!(project.error.is_none());
    assert!(project.artifacts.as_ref().unwrap()["result.txt"].contains("6 passed"));

    let retrying = stage_events(&harness.events(id).await, Stage::Retrying);
    assert!(retrying.iter().any(|(status, msg)| {
        *status == EventStatus::Failed && msg.contains("model overloaded")
    }));
}

#[tokio::test]
async fn test_install_failure_is_evaluated_and_retried() {
    // Only the regenerated artifact set ships the file the installer checks for
    let mut fixed = artifacts("9 passed, 1 failed");
    fixed.insert("deps.ok".to_string(), String::new());
    let artifacts = Arc::new(FakeArtifacts::new(artifacts("10 passed"), Ok(fixed)));

    let harness = Harness::with(
        collaborators(artifacts.clone(), None, None),
        pipeline_settings(),
        |sandbox| sandbox.install_command = sh("test -f deps.ok"),
    );

    let id = harness.start().await;
    let project = harness.finish(id).await;

    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(project.retry_count, 1);
    assert_eq!(project.test_result.as_ref().unwrap().percentage(), 90);

    let events = harness.events(id).await;
    let executed = events
        .iter()
        .find(|e| e.stage == Stage::Testing && e.status == EventStatus::Executed)
        .unwrap();
    assert_eq!(executed.message, "Results: 0/0 passed (0%)");
    assert_eq!(
        executed.data.as_ref().unwrap()["setup_failure"]["kind"],
        "dependency_install"
    );
    assert!(stage_events(&events, Stage::Testing).iter().any(|(status, msg)| {
        *status == EventStatus::Failed && msg.starts_with("Test execution aborted: Dependency installation failed")
    }));
}

#[tokio::test]
async fn test_invalid_spec_fails_at_planning() {
    let mut spec = valid_spec();
    spec.models.clear();
    let artifacts = Arc::new(FakeArtifacts::new(artifacts("10 passed"), Ok(artifacts("10 passed"))));
    let mut collab = collaborators(artifacts, None, None);
    collab.spec = Arc::new(FakeSpec::returning(spec));
    let harness = Harness::new(collab);

    let id = harness.start().await;
    let project = harness.finish(id).await;

    assert_eq!(project.status, ProjectStatus::Failed);
    assert_eq!(project.current_step, "planning");
    assert_eq!(
        project.error.as_deref(),
        Some("Specification must define at least one model")
    );
    assert!(project.spec.is_none());

    let events = harness.events(id).await;
    let last = events.last().unwrap();
    assert_eq!(last.stage, Stage::Planning);
    assert_eq!(last.status, EventStatus::Error);
    assert!(stage_events(&events, Stage::Building).is_empty());

    let live = harness.orchestrator.registry().get(id).unwrap();
    assert_eq!(live.step, "failed");
    assert_eq!(live.progress, 0);
    assert!(live.error.is_some());
}

#[tokio::test]
async fn test_build_generation_error_is_fatal() {
    let artifacts = Arc::new(FakeArtifacts {
        first: Err("context length exceeded".to_string()),
        retry: Ok(artifacts("10 passed")),
        regenerations: Default::default(),
    });
    let harness = Harness::new(collaborators(artifacts, None, None));

    let id = harness.start().await;
    let project = harness.finish(id).await;

    assert_eq!(project.status, ProjectStatus::Failed);
    assert_eq!(project.current_step, "building");
    assert_eq!(project.error.as_deref(), Some("context length exceeded"));
    assert!(project.test_result.is_none());
}

#[tokio::test]
async fn test_empty_test_set_is_fatal() {
    let artifacts = Arc::new(FakeArtifacts::new(artifacts("10 passed"), Ok(artifacts("10 passed"))));
    let mut collab = collaborators(artifacts, None, None);
    collab.tests = Arc::new(FakeTests(Default::default()));
    let harness = Harness::new(collab);

    let id = harness.start().await;
    let project = harness.finish(id).await;

    assert_eq!(project.status, ProjectStatus::Failed);
    assert_eq!(project.current_step, "testing");
    assert_eq!(project.error.as_deref(), Some("Test generator returned no files"));
    assert_eq!(harness.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_collaborator_timeout_fails_run() {
    let artifacts = Arc::new(FakeArtifacts::new(artifacts("10 passed"), Ok(artifacts("10 passed"))));
    let mut collab = collaborators(artifacts, None, None);
    collab.spec = Arc::new(FakeSpec {
        spec: valid_spec(),
        gate: None,
        hang: true,
    });
    let settings = PipelineSettings {
        collaborator_timeout: Duration::from_millis(100),
        ..pipeline_settings()
    };
    let harness = Harness::with(collab, settings, |_| {});

    let id = harness.start().await;
    let project = harness.finish(id).await;

    assert_eq!(project.status, ProjectStatus::Failed);
    assert_eq!(project.current_step, "planning");
    assert!(project.error.unwrap().starts_with("Timed out"));
}

#[tokio::test]
async fn test_publish_failure_is_non_blocking() {
    let artifacts = Arc::new(FakeArtifacts::new(artifacts("10 passed"), Ok(artifacts("10 passed"))));
    let publisher: Arc<dyn Publisher> = Arc::new(FakePublisher(Err("rate limited".to_string())));
    let deployer: Arc<dyn Deployer> = Arc::new(FakeDeployer);
    let harness = Harness::new(collaborators(artifacts, Some(publisher), Some(deployer)));

    let id = harness.start().await;
    let project = harness.finish(id).await;

    assert_eq!(project.status, ProjectStatus::Completed);
    assert!(project.publish_ref.is_none());
    assert!(project.deploy_ref.is_none());

    let events = harness.events(id).await;
    assert!(stage_events(&events, Stage::Publishing).iter().any(|(status, msg)| {
        *status == EventStatus::Failed && msg == "Publish failed (non-blocking): rate limited"
    }));
    assert_eq!(
        stage_events(&events, Stage::Deploying),
        vec![(EventStatus::Skipped, "No publish reference to deploy".to_string())]
    );
}

#[tokio::test]
async fn test_publish_and_deploy_record_references() {
    let artifacts = Arc::new(FakeArtifacts::new(artifacts("10 passed"), Ok(artifacts("10 passed"))));
    let publisher: Arc<dyn Publisher> =
        Arc::new(FakePublisher(Ok("https://github.com/me/autoship-todo-app".to_string())));
    let deployer: Arc<dyn Deployer> = Arc::new(FakeDeployer);
    let harness = Harness::new(collaborators(artifacts, Some(publisher), Some(deployer)));

    let id = harness.start().await;
    let project = harness.finish(id).await;

    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(
        project.publish_ref.as_deref(),
        Some("https://github.com/me/autoship-todo-app")
    );
    assert_eq!(project.deploy_ref.as_deref(), Some("https://todo_app.example.test"));

    let last = harness.events(id).await.pop().unwrap();
    let data = last.data.unwrap();
    assert_eq!(data["status"], "completed");
    assert_eq!(data["test_pass_rate"], 100);
    assert_eq!(data["deploy_ref"], "https://todo_app.example.test");
}

#[tokio::test]
async fn test_missing_collaborators_are_skipped() {
    let artifacts = Arc::new(FakeArtifacts::new(artifacts("10 passed"), Ok(artifacts("10 passed"))));
    let harness = Harness::new(collaborators(artifacts, None, None));

    let id = harness.start().await;
    harness.finish(id).await;

    let events = harness.events(id).await;
    assert_eq!(
        stage_events(&events, Stage::Publishing),
        vec![(EventStatus::Skipped, "No publisher configured".to_string())]
    );
    assert_eq!(
        stage_events(&events, Stage::Deploying),
        vec![(EventStatus::Skipped, "No deployer configured".to_string())]
    );
}

#[tokio::test]
async fn test_workspaces_are_removed_after_run() {
    let artifacts = Arc::new(FakeArtifacts::new(
        artifacts("6 passed, 2 failed"),
        Ok(artifacts("9 passed, 1 failed")),
    ));
    let harness = Harness::new(collaborators(artifacts, None, None));

    let id = harness.start().await;
    harness.finish(id).await;

    assert_eq!(harness.leftover_workspaces(), 0);
}

fn executed_data(events: &[autoship::domain::PipelineEvent]) -> serde_json::Value {
    events
        .iter()
        .find(|e| e.stage == Stage::Testing && e.status == EventStatus::Executed)
        .and_then(|e| e.data.clone())
        .expect("no executed event")
}

#[tokio::test]
async fn test_workspace_removed_when_harness_exits_nonzero() {
    let artifacts = Arc::new(FakeArtifacts::new(
        artifacts("9 passed, 1 failed"),
        Ok(artifacts("10 passed")),
    ));
    let harness = Harness::with(collaborators(artifacts, None, None), pipeline_settings(), |s| {
        s.test_command = sh("cat result.txt; exit 1");
    });

    let id = harness.start().await;
    let project = harness.finish(id).await;

    // A failing harness is data: counts still decide the outcome
    assert_eq!(project.status, ProjectStatus::Completed);
    let data = executed_data(&harness.events(id).await);
    assert_eq!(data["harness_error"], "Test harness exited with code 1");
    assert_eq!(data["percentage"], 90);
    assert_eq!(harness.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_workspace_removed_when_harness_times_out() {
    let artifacts = Arc::new(FakeArtifacts::new(
        artifacts("10 passed"),
        Ok(artifacts("10 passed")),
    ));
    let harness = Harness::with(collaborators(artifacts, None, None), pipeline_settings(), |s| {
        s.test_command = sh("cat result.txt; sleep 5");
        s.test_timeout = Duration::from_millis(300);
    });

    let id = harness.start().await;
    let project = harness.finish(id).await;

    assert_eq!(project.status, ProjectStatus::CompletedWithWarnings);
    assert_eq!(project.test_result.as_ref().unwrap().counts.total, 0);
    let data = executed_data(&harness.events(id).await);
    assert_eq!(data["harness_error"], "Test harness exited with code none");
    assert_eq!(harness.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_terminal_status_always_has_closing_event() {
    let artifacts = Arc::new(FakeArtifacts::new(
        artifacts("6 passed, 2 failed"),
        Ok(artifacts("9 passed, 1 failed")),
    ));
    let harness = Harness::new(collaborators(artifacts, None, None));
    let store = harness.orchestrator.store().clone();

    let id = harness.start().await;
    let project = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let project = store.get_project(id).await.unwrap().unwrap();
            if project.status.is_terminal() {
                return project;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("run did not finish in time");

    // Read straight after the first terminal status, with no settling delay
    let last = store.latest_event(id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(last.stage, Stage::Completed);
    assert_eq!(last.status, EventStatus::Success);
}

#[tokio::test]
async fn test_event_sequence_and_cursor() {
    let artifacts = Arc::new(FakeArtifacts::new(
        artifacts("6 passed, 2 failed"),
        Ok(artifacts("9 passed, 1 failed")),
    ));
    let harness = Harness::new(collaborators(artifacts, None, None));

    let id = harness.start().await;
    harness.finish(id).await;

    let events = harness.events(id).await;
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    assert_eq!(events[0].stage, Stage::Planning);
    assert_eq!(events[0].status, EventStatus::Started);

    let cursor = events[3].seq;
    let tail = harness.orchestrator.get_logs_since(id, cursor).await.unwrap();
    assert_eq!(tail.len(), events.len() - 4);
    assert!(tail.iter().all(|e| e.seq > cursor));

    let last = events.last().unwrap().seq;
    assert!(harness.orchestrator.get_logs_since(id, last).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_status_summarizes_stages() {
    let artifacts = Arc::new(FakeArtifacts::new(
        artifacts("6 passed, 2 failed"),
        Ok(artifacts("9 passed, 1 failed")),
    ));
    let harness = Harness::new(collaborators(artifacts, None, None));

    let id = harness.start().await;
    harness.finish(id).await;

    let view = harness.orchestrator.get_status(id).await.unwrap().unwrap();
    assert_eq!(view.project.status, ProjectStatus::Completed);
    assert_eq!(view.live.as_ref().unwrap().step, "done");
    assert_eq!(view.live.as_ref().unwrap().progress, 100);

    let summary: Vec<(Stage, &str)> = view
        .stages
        .iter()
        .map(|s| (s.stage, s.status.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (Stage::Planning, "completed"),
            (Stage::Building, "completed"),
            (Stage::Testing, "completed"),
            (Stage::Retrying, "retested"),
            (Stage::Publishing, "skipped"),
            (Stage::Deploying, "skipped"),
            (Stage::Completed, "success"),
        ]
    );
}

#[tokio::test]
async fn test_status_of_unknown_project() {
    let artifacts = Arc::new(FakeArtifacts::new(artifacts("10 passed"), Ok(artifacts("10 passed"))));
    let harness = Harness::new(collaborators(artifacts, None, None));

    let missing = uuid::Uuid::new_v4();
    assert!(harness.orchestrator.get_status(missing).await.unwrap().is_none());
}
