//! Execution sandbox.
//!
//! Materializes generated files into a fresh workspace, installs declared
//! dependencies, runs the external test harness and interprets its output.
//! Isolation is directory-level only.
//!
//! - `workspace`: Workspace allocation, file materialization, cleanup
//! - `interpreter`: Transcript -> pass/fail counts

pub mod interpreter;
pub mod workspace;

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::SandboxSettings;
use crate::domain::{FileSet, SetupFailure, TestResult};

pub use workspace::Workspace;

/// Outcome of one execution attempt.
///
/// The workspace stays on disk until the caller releases it.
#[derive(Debug)]
pub struct Execution {
    pub result: TestResult,
    pub workspace: Workspace,
}

/// Captured output of a finished (or timed out) subprocess
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// stdout followed by stderr
    pub transcript: String,
    /// None when the process was killed by a signal or timed out
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs generated tests against generated artifacts
#[derive(Debug, Clone)]
pub struct Sandbox {
    settings: SandboxSettings,
}

impl Sandbox {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }

    /// Run one execution attempt in a new workspace.
    ///
    /// Never fails: setup problems produce a zeroed result carrying a
    /// `SetupFailure`, and a non-zero harness exit is data, not an error.
    #[instrument(skip_all, fields(artifacts = artifacts.len(), tests = tests.len()))]
    pub async fn execute(&self, artifacts: &FileSet, tests: &FileSet) -> Execution {
        let workspace = Workspace::new(&self.settings.workspaces_dir);
        let ws_path = workspace.path().to_path_buf();
        info!(workspace = %ws_path.display(), "Preparing workspace");

        if let Err(e) = self.materialize(&workspace, artifacts, tests).await {
            warn!(error = %e, "Workspace setup failed");
            let message = format!("{:#}", e);
            let result = TestResult::aborted(
                SetupFailure::Workspace {
                    message: message.clone(),
                },
                format!("Workspace setup failed:\n{}", message),
                Some(ws_path),
            );
            return Execution { result, workspace };
        }

        if !self.settings.install_command.is_empty() {
            debug!("Installing dependencies");
            let install = run_command(
                &self.settings.install_command,
                &ws_path,
                self.settings.install_timeout,
            )
            .await;

            let failure = match install {
                Ok(out) if out.success() => None,
                Ok(out) => {
                    if out.timed_out {
                        warn!(limit = ?self.settings.install_timeout, "Dependency installation timed out");
                    }
                    Some((out.exit_code, out.transcript))
                }
                Err(e) => Some((None, format!("{:#}", e))),
            };

            if let Some((exit_code, transcript)) = failure {
                warn!(?exit_code, "Dependency installation failed");
                let result = TestResult::aborted(
                    SetupFailure::DependencyInstall { exit_code },
                    format!("Dependency installation failed:\n{}", transcript),
                    Some(ws_path),
                );
                return Execution { result, workspace };
            }
        }

        debug!("Running test harness");
        let (transcript, exit_code) = match run_command(
            &self.settings.test_command,
            &ws_path,
            self.settings.test_timeout,
        )
        .await
        {
            Ok(out) => {
                if out.timed_out {
                    warn!(limit = ?self.settings.test_timeout, "Test harness timed out");
                }
                (out.transcript, out.exit_code)
            }
            Err(e) => (format!("Test harness could not be started: {:#}", e), None),
        };

        let counts = interpreter::parse(&transcript);
        info!(
            passed = counts.passed,
            failed = counts.failed,
            errors = counts.errors,
            percentage = counts.percentage,
            ?exit_code,
            "Test harness finished"
        );

        let result = TestResult {
            counts,
            output: transcript,
            workspace_path: Some(ws_path),
            exit_code,
            setup_failure: None,
        };

        Execution { result, workspace }
    }

    async fn materialize(
        &self,
        workspace: &Workspace,
        artifacts: &FileSet,
        tests: &FileSet,
    ) -> Result<()> {
        workspace.create().await?;
        workspace.write_files(artifacts).await?;
        workspace.write_files(tests).await?;
        workspace
            .ensure_markers(
                &self.settings.package_marker,
                &self.settings.test_dir,
                &[artifacts, tests],
            )
            .await?;
        Ok(())
    }
}

/// Run a subprocess in `cwd`, capturing stdout and stderr regardless of exit code.
///
/// The child is killed if it outlives `limit`.
pub async fn run_command(argv: &[String], cwd: &Path, limit: Duration) -> Result<CommandOutput> {
    let (program, args) = argv.split_first().context("Empty command")?;

    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", program))?;

    match timeout(limit, child.wait_with_output()).await {
        Ok(output) => {
            let output =
                output.with_context(|| format!("Failed to wait for '{}'", program))?;
            let transcript = format!(
                "{}\n{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            Ok(CommandOutput {
                transcript,
                exit_code: output.status.code(),
                timed_out: false,
            })
        }
        Err(_) => Ok(CommandOutput {
            transcript: format!("'{}' timed out after {:?}", argv.join(" "), limit),
            exit_code: None,
            timed_out: true,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn files(entries: &[(&str, &str)]) -> FileSet {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    fn settings(base: &Path, install: Vec<String>, test: Vec<String>) -> SandboxSettings {
        let mut s = SandboxSettings::with_workspaces_dir(base.to_path_buf());
        s.install_command = install;
        s.test_command = test;
        s.install_timeout = Duration::from_secs(10);
        s.test_timeout = Duration::from_secs(10);
        s
    }

    #[tokio::test]
    async fn test_run_command_captures_both_streams() {
        let temp = TempDir::new().unwrap();
        let out = run_command(&sh("echo out; echo err >&2; exit 3"), temp.path(), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(out.transcript.contains("out"));
        assert!(out.transcript.contains("err"));
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let temp = TempDir::new().unwrap();
        let out = run_command(&sh("sleep 5"), temp.path(), Duration::from_millis(100))
            .await
            .unwrap();

        assert!(out.timed_out);
        assert!(out.exit_code.is_none());
    }

    #[tokio::test]
    async fn test_run_command_empty_argv() {
        let temp = TempDir::new().unwrap();
        assert!(run_command(&[], temp.path(), Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_execute_parses_harness_output() {
        let temp = TempDir::new().unwrap();
        let sandbox = Sandbox::new(settings(
            temp.path(),
            vec![],
            sh("test -f main.py && test -f tests/__init__.py && echo '=== 2 failed, 6 passed in 0.1s ==='; exit 1"),
        ));

        let exec = sandbox
            .execute(
                &files(&[("main.py", "app = 1")]),
                &files(&[("tests/test_main.py", "def test_x(): pass")]),
            )
            .await;

        assert_eq!(exec.result.counts.passed, 6);
        assert_eq!(exec.result.counts.failed, 2);
        assert_eq!(exec.result.percentage(), 75);
        assert_eq!(exec.result.exit_code, Some(1));
        assert!(exec.result.setup_failure.is_none());

        let path = exec.workspace.path().to_path_buf();
        assert!(path.exists());
        exec.workspace.release().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_execute_install_failure_short_circuits() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("harness-ran");
        let sandbox = Sandbox::new(settings(
            temp.path().join("ws").as_path(),
            sh("echo 'No matching distribution'; exit 1"),
            sh(&format!("touch {}", marker.display())),
        ));

        let exec = sandbox
            .execute(&files(&[("main.py", "")]), &files(&[("tests/test_a.py", "")]))
            .await;

        assert_eq!(exec.result.counts.total, 0);
        assert_eq!(exec.result.percentage(), 0);
        assert_eq!(
            exec.result.setup_failure,
            Some(SetupFailure::DependencyInstall { exit_code: Some(1) })
        );
        assert!(exec.result.output.contains("No matching distribution"));
        assert!(!marker.exists());
        exec.workspace.release().await;
    }

    #[tokio::test]
    async fn test_execute_rejects_escaping_paths() {
        let temp = TempDir::new().unwrap();
        let sandbox = Sandbox::new(settings(temp.path(), vec![], sh("echo '1 passed'")));

        let exec = sandbox
            .execute(&files(&[("../evil.py", "")]), &files(&[("tests/t.py", "")]))
            .await;

        assert_eq!(exec.result.counts.total, 0);
        assert!(matches!(
            exec.result.setup_failure,
            Some(SetupFailure::Workspace { .. })
        ));
        exec.workspace.release().await;
    }

    #[tokio::test]
    async fn test_execute_missing_harness_binary() {
        let temp = TempDir::new().unwrap();
        let sandbox = Sandbox::new(settings(
            temp.path(),
            vec![],
            vec!["autoship-no-such-harness".to_string()],
        ));

        let exec = sandbox.execute(&files(&[("a.py", "")]), &FileSet::new()).await;
        assert_eq!(exec.result.counts.total, 0);
        assert!(exec.result.exit_code.is_none());
        assert!(exec.result.output.contains("could not be started"));

        let path = exec.workspace.path().to_path_buf();
        exec.workspace.release().await;
        assert!(!path.exists());
    }
}
