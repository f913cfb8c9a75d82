//! Deployment targets.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, instrument};

use super::{slug, Deployer};
use crate::domain::FileSet;

const RAILWAY_GRAPHQL: &str = "https://backboard.railway.app/graphql/v2";
const MAX_SERVICE_NAME: usize = 50;

/// Creates a Railway project and a service sourced from the published repo
pub struct RailwayDeployer {
    token: String,
    http: reqwest::Client,
}

impl RailwayDeployer {
    pub fn new(token: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { token, http })
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value> {
        let response = self
            .http
            .post(RAILWAY_GRAPHQL)
            .bearer_auth(&self.token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .context("Failed to reach Railway")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Railway API error ({}): {}", status, body);
        }

        let body: Value = response
            .json()
            .await
            .context("Failed to parse Railway response")?;
        if let Some(errors) = body.get("errors") {
            anyhow::bail!("Railway GraphQL error: {}", errors);
        }
        Ok(body)
    }
}

/// `owner/repo` from a GitHub URL
pub fn repo_path(publish_ref: &str) -> &str {
    publish_ref
        .trim_start_matches("https://github.com/")
        .trim_end_matches(".git")
        .trim_end_matches('/')
}

#[async_trait]
impl Deployer for RailwayDeployer {
    fn name(&self) -> &str {
        "railway"
    }

    #[instrument(skip(self, _artifacts))]
    async fn deploy(&self, name: &str, publish_ref: &str, _artifacts: &FileSet) -> Result<String> {
        let service_name = slug(name, MAX_SERVICE_NAME);

        let created = self
            .graphql(
                "mutation($name: String!) { projectCreate(input: { name: $name }) { id name } }",
                json!({ "name": service_name }),
            )
            .await?;
        let project_id = created["data"]["projectCreate"]["id"]
            .as_str()
            .context("Railway project creation returned no ID")?
            .to_string();

        self.graphql(
            "mutation($projectId: String!, $name: String!, $repo: String!) { \
             serviceCreate(input: { projectId: $projectId, name: $name, source: { repo: $repo } }) { id } }",
            json!({
                "projectId": project_id,
                "name": format!("{}-service", service_name),
                "repo": repo_path(publish_ref),
            }),
        )
        .await?;

        let url = format!("https://railway.app/project/{}", project_id);
        info!(%url, "Deployment triggered");
        Ok(url)
    }
}

/// Records that the application must be deployed by hand
pub struct ManualDeployer;

#[async_trait]
impl Deployer for ManualDeployer {
    fn name(&self) -> &str {
        "manual"
    }

    async fn deploy(&self, name: &str, _publish_ref: &str, _artifacts: &FileSet) -> Result<String> {
        Ok(format!("manual://{}", name))
    }
}
