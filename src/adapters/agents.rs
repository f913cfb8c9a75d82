//! LLM-backed generators.
//!
//! Target stack of the generated application is FastAPI + SQLite with a
//! pytest suite. Each generator is a single JSON-mode completion.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument};

use super::llm::{extract_json, LlmClient};
use super::{ArtifactGenerator, SpecGenerator, TestGenerator};
use crate::domain::{AppSpec, FileSet};

/// Failure transcripts are truncated to their tail before being sent back
const TRANSCRIPT_TAIL_CHARS: usize = 6000;

const PLANNER_PROMPT: &str = r#"You convert a product idea into a JSON specification for a small CRUD web service (Python FastAPI + SQLite).

Constraints:
- CRUD operations only; no file uploads, websockets or background jobs
- Simple token auth only if the idea needs users
- At most 6 models and at most 20 endpoints

Return one JSON object with exactly these keys:
{
  "app_name": "snake_case name",
  "display_name": "Human readable name",
  "description": "one line",
  "models": [{"name": "PascalCase", "table_name": "snake_case",
              "fields": [{"name": "snake_case", "type": "string|integer|float|boolean|text|datetime",
                          "required": true, "unique": false, "default": null}],
              "relationships": [{"type": "belongs_to|has_many", "model": "Name", "foreign_key": "name_id"}]}],
  "endpoints": [{"method": "GET|POST|PUT|DELETE", "path": "/api/...", "description": "...",
                 "model": "Name", "operation": "create|read_one|read_all|update|delete|custom",
                 "auth_required": false}],
  "features": ["..."],
  "has_auth": false,
  "auth_model": null
}

Do not list id, created_at or updated_at fields; they are implicit. Return only JSON."#;

const BUILDER_PROMPT: &str = r#"You write the complete source of a FastAPI + SQLite service from a JSON specification.

Return one JSON object mapping relative file paths to file contents, for example
{"main.py": "...", "database.py": "...", "models.py": "...", "routers/items.py": "...", "requirements.txt": "..."}

Rules:
- main.py must define `app`
- requirements.txt must list every third-party package used
- Use only relative paths inside the project; no tests
- Return only JSON"#;

const QA_PROMPT: &str = r#"You write a pytest suite for a generated FastAPI + SQLite service.

Return one JSON object mapping test file paths (under tests/) to contents, for example
{"tests/conftest.py": "...", "tests/test_main.py": "..."}

Rules:
- Use fastapi.testclient.TestClient against `app` from main.py; synchronous tests only
- Override the database with an isolated SQLite file or in-memory database
- Cover create, read, update and delete for every model, plus 404 and validation errors
- Imports must match the given source files exactly
- Return only JSON"#;

/// Convert a JSON reply into a file set.
///
/// Accepts either a flat `{path: content}` object or one nested under `files`.
pub fn file_set_from_json(value: Value) -> Result<FileSet> {
    let object = match value {
        Value::Object(mut map) => match map.remove("files") {
            Some(Value::Object(files)) => files,
            Some(other) => {
                map.insert("files".to_string(), other);
                map
            }
            None => map,
        },
        _ => anyhow::bail!("Expected a JSON object of files"),
    };

    object
        .into_iter()
        .map(|(path, content)| match content {
            Value::String(s) => Ok((path, s)),
            _ => anyhow::bail!("File content for '{}' is not a string", path),
        })
        .collect()
}

fn transcript_tail(transcript: &str) -> &str {
    let len = transcript.chars().count();
    if len <= TRANSCRIPT_TAIL_CHARS {
        return transcript;
    }
    let skip = len - TRANSCRIPT_TAIL_CHARS;
    match transcript.char_indices().nth(skip) {
        Some((idx, _)) => &transcript[idx..],
        None => transcript,
    }
}

pub struct LlmSpecGenerator {
    llm: Arc<LlmClient>,
}

impl LlmSpecGenerator {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl SpecGenerator for LlmSpecGenerator {
    #[instrument(skip_all)]
    async fn generate(&self, request: &str) -> Result<AppSpec> {
        let prompt = format!(
            "Product idea: {}\n\nProduce the specification for a working MVP. \
             Include auth only if the idea mentions or implies users.",
            request
        );
        let spec: AppSpec = self
            .llm
            .complete_json(PLANNER_PROMPT, &prompt)
            .await
            .context("Planner failed")?;
        info!(app = %spec.app_name, "Specification generated");
        Ok(spec)
    }
}

pub struct LlmArtifactGenerator {
    llm: Arc<LlmClient>,
}

impl LlmArtifactGenerator {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    async fn files(&self, prompt: &str) -> Result<FileSet> {
        let raw = self.llm.complete(BUILDER_PROMPT, prompt, true).await?;
        file_set_from_json(extract_json(&raw)?)
    }
}

#[async_trait]
impl ArtifactGenerator for LlmArtifactGenerator {
    #[instrument(skip_all, fields(app = %spec.app_name))]
    async fn generate(&self, spec: &AppSpec) -> Result<FileSet> {
        let prompt = format!(
            "SPECIFICATION:\n{}\n\nGenerate every source file.",
            serde_json::to_string_pretty(spec)?
        );
        self.files(&prompt).await.context("Builder failed")
    }

    #[instrument(skip_all, fields(app = %spec.app_name, prior = prior.len()))]
    async fn regenerate(
        &self,
        spec: &AppSpec,
        prior: &FileSet,
        failure_transcript: &str,
    ) -> Result<FileSet> {
        let prompt = format!(
            "SPECIFICATION:\n{}\n\nPREVIOUS SOURCE FILES:\n{}\n\nTEST OUTPUT:\n{}\n\n\
             The tests above failed against the previous files. Return the complete corrected \
             file set, not a diff.",
            serde_json::to_string_pretty(spec)?,
            serde_json::to_string_pretty(prior)?,
            transcript_tail(failure_transcript)
        );
        self.files(&prompt).await.context("Builder retry failed")
    }
}

pub struct LlmTestGenerator {
    llm: Arc<LlmClient>,
}

impl LlmTestGenerator {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl TestGenerator for LlmTestGenerator {
    #[instrument(skip_all, fields(app = %spec.app_name, artifacts = artifacts.len()))]
    async fn generate(&self, spec: &AppSpec, artifacts: &FileSet) -> Result<FileSet> {
        let prompt = format!(
            "SPECIFICATION:\n{}\n\nSOURCE FILES:\n{}\n\nWrite the test suite.",
            serde_json::to_string_pretty(spec)?,
            serde_json::to_string_pretty(artifacts)?
        );
        let raw = self.llm.complete(QA_PROMPT, &prompt, true).await?;
        file_set_from_json(extract_json(&raw)?).context("QA test generation failed")
    }
}
