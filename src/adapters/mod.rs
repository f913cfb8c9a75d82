//! Adapter interfaces for external collaborators.
//!
//! The orchestrator talks to every generator and shipping target through the
//! traits below. Concrete implementations:
//! - `agents`: LLM-backed spec, artifact and test generators
//! - `github`: repository publishing
//! - `deploy`: Railway and manual deployment

pub mod agents;
pub mod deploy;
pub mod github;
pub mod llm;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::config::ResolvedConfig;
use crate::domain::{AppSpec, FileSet};

pub use agents::{LlmArtifactGenerator, LlmSpecGenerator, LlmTestGenerator};
pub use deploy::{ManualDeployer, RailwayDeployer};
pub use github::GithubPublisher;
pub use llm::LlmClient;

/// Turns a request into a structured specification
#[async_trait]
pub trait SpecGenerator: Send + Sync {
    async fn generate(&self, request: &str) -> Result<AppSpec>;
}

/// Produces application source files
#[async_trait]
pub trait ArtifactGenerator: Send + Sync {
    async fn generate(&self, spec: &AppSpec) -> Result<FileSet>;

    /// Produce a corrected file set given the previous attempt and its
    /// failing harness transcript
    async fn regenerate(
        &self,
        spec: &AppSpec,
        prior: &FileSet,
        failure_transcript: &str,
    ) -> Result<FileSet>;
}

/// Produces a test suite for generated artifacts
#[async_trait]
pub trait TestGenerator: Send + Sync {
    async fn generate(&self, spec: &AppSpec, artifacts: &FileSet) -> Result<FileSet>;
}

/// Ships the generated files somewhere durable; returns a reference
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, name: &str, description: &str, files: &FileSet) -> Result<String>;
}

/// Deploys a published application; returns a reference
#[async_trait]
pub trait Deployer: Send + Sync {
    fn name(&self) -> &str;

    async fn deploy(&self, name: &str, publish_ref: &str, artifacts: &FileSet) -> Result<String>;
}

/// Lowercase name restricted to `[a-z0-9-]`, truncated to `max_len`
pub fn slug(name: &str, max_len: usize) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(max_len)
        .collect()
}

/// The full set of collaborators a run needs
#[derive(Clone)]
pub struct Collaborators {
    pub spec: Arc<dyn SpecGenerator>,
    pub artifacts: Arc<dyn ArtifactGenerator>,
    pub tests: Arc<dyn TestGenerator>,
    /// None skips the publishing stage
    pub publisher: Option<Arc<dyn Publisher>>,
    /// None skips the deploying stage
    pub deployer: Option<Arc<dyn Deployer>>,
}

impl Collaborators {
    /// Wire the LLM generators plus whatever shipping targets have tokens
    pub fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let llm = Arc::new(LlmClient::new(config.llm.clone())?);

        let publisher: Option<Arc<dyn Publisher>> = match &config.publish.github_token {
            Some(token) => Some(Arc::new(GithubPublisher::new(
                token.clone(),
                config.publish.repo_prefix.clone(),
            )?)),
            None => None,
        };

        let deployer: Option<Arc<dyn Deployer>> = match &config.publish.railway_token {
            Some(token) => Some(Arc::new(RailwayDeployer::new(token.clone())?)),
            None if config.publish.manual_deploy => Some(Arc::new(ManualDeployer)),
            None => None,
        };

        info!(
            model = %llm.model(),
            publisher = publisher.as_ref().map(|p| p.name()).unwrap_or("none"),
            deployer = deployer.as_ref().map(|d| d.name()).unwrap_or("none"),
            "Collaborators configured"
        );

        Ok(Self {
            spec: Arc::new(LlmSpecGenerator::new(llm.clone())),
            artifacts: Arc::new(LlmArtifactGenerator::new(llm.clone())),
            tests: Arc::new(LlmTestGenerator::new(llm)),
            publisher,
            deployer,
        })
    }
}
