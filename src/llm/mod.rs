pub mod prompts;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::Tier;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The model used for all generation calls.
/// Intentionally hardcoded to prevent accidental drift.
pub const MODEL: &str = "claude-3-5-haiku-20241022";
const MAX_TOKENS: u32 = 4000;
const MAX_ATTEMPTS: u32 = 3;
/// Input beyond this is truncated before submission. A cost and latency
/// bound, not a correctness requirement.
const MAX_INPUT_CHARS: usize = 4000;

const CRITIQUE_TEMPERATURE: f32 = 0.9;
const REWRITE_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("upstream rejected credentials (status {status})")]
    Auth { status: u16 },

    #[error("upstream failure (status {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model returned empty content")]
    EmptyContent,

    #[error("model output failed to parse: {0}")]
    MalformedOutput(#[from] serde_json::Error),
}

impl GenerationError {
    /// Credential rejections cannot succeed on retry; everything else can.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, GenerationError::Auth { .. })
    }
}

/// The structured humorous review artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueReport {
    pub score: i16,
    pub lines: Vec<String>,
    pub issues: Vec<String>,
    pub summary: String,
}

/// Generation seam for the delivery workflow. The production implementation
/// is `GenerationClient`; tests substitute scripted stubs.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn critique(&self, resume_text: &str) -> Result<CritiqueReport, GenerationError>;

    async fn rewrite(&self, resume_text: &str, tier: Tier) -> Result<String, GenerationError>;
}

#[derive(Debug, Serialize)]
struct ClaudeRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClaudeError {
    error: ClaudeErrorBody,
}

#[derive(Debug, Deserialize)]
struct ClaudeErrorBody {
    message: String,
}

/// Wraps the Claude Messages API with bounded retry.
#[derive(Clone)]
pub struct GenerationClient {
    client: Client,
    api_key: String,
}

impl GenerationClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, api_key }
    }

    async fn complete(
        &self,
        system: &str,
        content: String,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        with_retry(|| self.attempt(system, &content, temperature)).await
    }

    async fn attempt(
        &self,
        system: &str,
        content: &str,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        let body = ClaudeRequest {
            model: MODEL.to_string(),
            max_tokens: MAX_TOKENS,
            temperature,
            system: system.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: content.to_string(),
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();

        if status == 401 || status == 403 {
            return Err(GenerationError::Auth { status });
        }

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ClaudeError>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(GenerationError::Upstream { status, message });
        }

        let parsed: ClaudeResponse = response.json().await?;
        parsed
            .content
            .iter()
            .find(|b| b.block_type == "text")
            .and_then(|b| b.text.clone())
            .filter(|t| !t.trim().is_empty())
            .ok_or(GenerationError::EmptyContent)
    }
}

#[async_trait]
impl Generator for GenerationClient {
    async fn critique(&self, resume_text: &str) -> Result<CritiqueReport, GenerationError> {
        info!(
            "generating critique ({} chars of input)",
            resume_text.len()
        );
        let content = format!(
            "Roast this resume:\n\n{}",
            truncate_chars(resume_text, MAX_INPUT_CHARS)
        );
        let text = self
            .complete(prompts::CRITIQUE_SYSTEM_PROMPT, content, CRITIQUE_TEMPERATURE)
            .await?;
        parse_critique(&text)
    }

    async fn rewrite(&self, resume_text: &str, tier: Tier) -> Result<String, GenerationError> {
        info!("generating rewrite (tier {:?})", tier);
        let system = prompts::rewrite_system_prompt(tier == Tier::Pro);
        let content = format!(
            "Rewrite this resume:\n\n{}",
            truncate_chars(resume_text, MAX_INPUT_CHARS)
        );
        self.complete(&system, content, REWRITE_TEMPERATURE).await
    }
}

/// Runs `attempt` up to `MAX_ATTEMPTS` times. Non-retryable errors surface
/// immediately; otherwise the delay grows linearly with the attempt number
/// and the last error is returned once attempts are exhausted.
async fn with_retry<F, Fut>(mut attempt: F) -> Result<String, GenerationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String, GenerationError>>,
{
    let mut last_error = None;

    for n in 1..=MAX_ATTEMPTS {
        match attempt().await {
            Ok(text) => return Ok(text),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                warn!("generation attempt {n}/{MAX_ATTEMPTS} failed: {e}");
                last_error = Some(e);
                if n < MAX_ATTEMPTS {
                    tokio::time::sleep(Duration::from_secs(u64::from(n))).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or(GenerationError::EmptyContent))
}

fn parse_critique(text: &str) -> Result<CritiqueReport, GenerationError> {
    let report: CritiqueReport = serde_json::from_str(strip_json_fences(text))?;
    Ok(CritiqueReport {
        score: report.score.clamp(1, 10),
        ..report
    })
}

/// Strips ```json ... ``` or ``` ... ``` code fences the model sometimes
/// wraps JSON output in.
fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start()
        .strip_suffix("```")
        .map(str::trim)
        .unwrap_or_else(|| rest.trim())
}

/// Truncates to at most `max` characters, never splitting a code point.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
