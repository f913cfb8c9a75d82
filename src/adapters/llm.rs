//! OpenAI-compatible chat completions client.
//!
//! Generators ask for JSON output; replies are run through a tolerant
//! extractor since models still wrap JSON in code fences or prose.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmSettings;

/// Maximum characters of a bad reply quoted in parse errors
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct LlmClient {
    settings: LlmSettings,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { settings, http })
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    /// One chat completion; returns the first choice's content
    pub async fn complete(&self, system_prompt: &str, user_prompt: &str, json: bool) -> Result<String> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .context("OPENAI_API_KEY not configured")?;

        let request = ChatRequest {
            model: &self.settings.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            response_format: json.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        debug!(model = %self.settings.model, json, "Sending completion request");
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send completion request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Completion API error ({}): {}", status, body);
        }

        let completion: ChatResponse = response
            .json()
            .await
            .context("Failed to parse completion response")?;

        Ok(completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default())
    }

    /// Completion in JSON mode, decoded into `T`
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<T> {
        let raw = self.complete(system_prompt, user_prompt, true).await?;
        let value = extract_json(&raw)?;
        serde_json::from_value(value).context("LLM JSON did not match the expected shape")
    }
}

/// Parse a JSON object out of a model reply.
///
/// Strips Markdown code fences, then falls back to the outermost `{...}`.
pub fn extract_json(raw: &str) -> Result<serde_json::Value> {
    let cleaned: String = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");
    let cleaned = cleaned.trim();

    if let Ok(value) = serde_json::from_str(cleaned) {
        return Ok(value);
    }

    if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str(&cleaned[start..=end]) {
                return Ok(value);
            }
        }
    }

    let preview: String = raw.chars().take(PREVIEW_CHARS).collect();
    anyhow::bail!("Failed to parse LLM JSON response: {}", preview)
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}
