//! GitHub publisher.
//!
//! Creates a public repository through the REST API, then pushes every file
//! with the `git` CLI from a throwaway directory.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::fs;
use tracing::{info, instrument};

use super::{slug, Publisher};
use crate::domain::FileSet;
use crate::sandbox::run_command;
use crate::sandbox::workspace::safe_relative;

const API_BASE: &str = "https://api.github.com";
const GIT_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_REPO_NAME: usize = 100;

pub struct GithubPublisher {
    token: String,
    repo_prefix: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CreateRepo<'a> {
    name: &'a str,
    description: &'a str,
    private: bool,
    auto_init: bool,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    html_url: String,
    full_name: String,
}

impl GithubPublisher {
    pub fn new(token: String, repo_prefix: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("autoship/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            token,
            repo_prefix,
            http,
        })
    }

    /// Repository name for an application
    pub fn repo_name(&self, name: &str) -> String {
        slug(&format!("{}{}", self.repo_prefix, name), MAX_REPO_NAME)
    }

    async fn create_repo(&self, name: &str, description: &str) -> Result<RepoResponse> {
        let response = self
            .http
            .post(format!("{}/user/repos", API_BASE))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&CreateRepo {
                name,
                description,
                private: false,
                auto_init: false,
            })
            .send()
            .await
            .context("Failed to reach GitHub")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub API error ({}): {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse GitHub response")
    }

    async fn push(&self, full_name: &str, files: &FileSet) -> Result<()> {
        let dir = TempDir::new().context("Failed to create push directory")?;

        for (rel_path, content) in files {
            let path = dir.path().join(safe_relative(rel_path)?);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        let remote = format!(
            "https://x-access-token:{}@github.com/{}.git",
            self.token, full_name
        );
        let steps: [&[&str]; 5] = [
            &["git", "init", "-b", "main"],
            &["git", "add", "-A"],
            &[
                "git",
                "-c",
                "user.name=autoship",
                "-c",
                "user.email=autoship@users.noreply.github.com",
                "commit",
                "-m",
                "Initial commit",
            ],
            &["git", "remote", "add", "origin", remote.as_str()],
            &["git", "push", "-u", "origin", "main"],
        ];

        for step in steps {
            let argv: Vec<String> = step.iter().map(|s| s.to_string()).collect();
            let out = run_command(&argv, dir.path(), GIT_TIMEOUT).await?;
            if !out.success() {
                // The remote URL embeds the token
                anyhow::bail!(
                    "'{}' failed: {}",
                    step.join(" ").replace(&self.token, "***"),
                    out.transcript.replace(&self.token, "***").trim()
                );
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Publisher for GithubPublisher {
    fn name(&self) -> &str {
        "github"
    }

    #[instrument(skip(self, description, files), fields(files = files.len()))]
    async fn publish(&self, name: &str, description: &str, files: &FileSet) -> Result<String> {
        let repo_name = self.repo_name(name);
        let repo = self.create_repo(&repo_name, description).await?;
        self.push(&repo.full_name, files).await?;

        info!(url = %repo.html_url, "Repository published");
        Ok(repo.html_url)
    }
}
