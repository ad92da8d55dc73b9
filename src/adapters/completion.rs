//! HTTP completion engine client.
//!
//! Endpoints (JSON, bearer auth):
//! - `POST {endpoint}/analyze`: `{prompt, content_refs}` -> `{result, usage, blocked, search_queries}`
//! - `POST {endpoint}/count-tokens`: `{prompt, content_refs}` -> `{total_tokens}`

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::PipelineError;

use super::{CompletionEngine, CompletionOutput};

pub struct HttpCompletionEngine {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    content_refs: &'a [String],
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    thinking_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    usage: Usage,
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    block_reason: Option<String>,
    #[serde(default)]
    search_queries: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    total_tokens: u64,
}

impl HttpCompletionEngine {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    async fn post(&self, path: &str, body: &CompletionRequest<'_>) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.endpoint, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(PipelineError::transient)
            .with_context(|| format!("Failed to reach completion engine at {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Transient(format!("{} returned {}: {}", url, status, text.trim())).into());
        }
        Ok(response)
    }
}

/// Validate an analyze response into a structured result
fn into_output(response: AnalyzeResponse) -> Result<CompletionOutput, PipelineError> {
    if response.blocked {
        return Err(PipelineError::Completion(format!(
            "response blocked: {}",
            response.block_reason.as_deref().unwrap_or("no reason given")
        )));
    }

    let result = match response.result {
        None | Some(Value::Null) => return Err(PipelineError::Completion("empty response".into())),
        Some(Value::String(text)) => parse_text_result(&text)?,
        Some(other) => other,
    };
    if !result.is_object() {
        return Err(PipelineError::Completion(format!(
            "expected a JSON object, got {}",
            kind_of(&result)
        )));
    }

    Ok(CompletionOutput {
        result,
        input_tokens: response.usage.input_tokens,
        output_tokens: response.usage.output_tokens,
        thinking_tokens: response.usage.thinking_tokens,
        search_queries: response.search_queries,
    })
}

/// Results sometimes arrive as JSON text, optionally inside a markdown fence
fn parse_text_result(text: &str) -> Result<Value, PipelineError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::Completion("empty response".into()));
    }
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim())
        .map_err(|e| PipelineError::Completion(format!("unparsable response: {}", e)))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl CompletionEngine for HttpCompletionEngine {
    async fn submit(&self, prompt: &str, content_refs: &[String]) -> Result<CompletionOutput> {
        let body = CompletionRequest { prompt, content_refs };
        let response: AnalyzeResponse = self
            .post("analyze", &body)
            .await?
            .json()
            .await
            .map_err(|e| PipelineError::Completion(format!("unparsable response: {}", e)))?;

        let output = into_output(response)?;
        debug!(
            input_tokens = output.input_tokens,
            output_tokens = output.output_tokens,
            "Completion received"
        );
        Ok(output)
    }

    async fn count_tokens(&self, prompt: &str, content_refs: &[String]) -> Result<u64> {
        let body = CompletionRequest { prompt, content_refs };
        let response: CountResponse = self
            .post("count-tokens", &body)
            .await?
            .json()
            .await
            .map_err(PipelineError::transient)
            .context("Invalid token count response")?;
        Ok(response.total_tokens)
    }
}
