//! Completion API client.
//!
//! The dispatcher calls [`CompletionClient::complete`] once per request. No
//! retry happens here: a failed or timed-out request is recorded by the
//! dispatcher and excluded from the merge.
//!
//! The model is asked to answer with a JSON object:
//!
//! ```json
//! {
//!   "summary": "one paragraph",
//!   "findings": [
//!     {"file": "src/a.rs", "line": 12, "severity": "high",
//!      "category": "bug", "message": "...", "confidence": 0.8}
//!   ]
//! }
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::split::PromptPayload;
use crate::config::CompletionConfig;
use crate::models::{Finding, Severity};

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";

const SYSTEM_PROMPT: &str = "You are a meticulous code reviewer. Review only the changed lines; \
use the related code for context. Answer with a single JSON object with keys \
\"summary\" (string) and \"findings\" (array of objects with keys \"file\", \"line\", \
\"severity\" one of info|low|medium|high|critical, \"category\", \"message\", \"confidence\" 0..1). \
Return an empty findings array when nothing needs attention.";

/// Parsed answer to one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub summary: Option<String>,
    pub findings: Vec<Finding>,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn name(&self) -> &str;

    /// System message sent with every request; counted against the request cap.
    fn system_prompt(&self) -> &str {
        ""
    }

    /// Single attempt; `timeout` bounds the whole call.
    async fn complete(&self, payload: &PromptPayload, timeout: Duration) -> Result<CompletionResponse>;
}

// ============ Disabled ============

pub struct DisabledCompletionClient;

#[async_trait]
impl CompletionClient for DisabledCompletionClient {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _payload: &PromptPayload, _timeout: Duration) -> Result<CompletionResponse> {
        bail!("Completion provider is disabled")
    }
}

// ============ OpenAI ============

/// Client for an OpenAI-compatible `/v1/chat/completions` endpoint.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAICompletionClient {
    model: String,
    base_url: String,
    api_key: String,
    max_output_tokens: usize,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAICompletionClient {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("completion.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            api_key,
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAICompletionClient {
    fn name(&self) -> &str {
        &self.model
    }

    fn system_prompt(&self) -> &str {
        SYSTEM_PROMPT
    }

    async fn complete(&self, payload: &PromptPayload, timeout: Duration) -> Result<CompletionResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_output_tokens,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": payload.render()},
            ],
        });

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .context("completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Completion API error {}: {}", status, text);
        }

        let json: serde_json::Value = response.json().await?;
        let content = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing message content"))?;

        let mut parsed = parse_review_json(content)?;
        parsed.prompt_tokens = json
            .pointer("/usage/prompt_tokens")
            .and_then(|v| v.as_u64())
            .map_or(payload.token_count, |v| v as usize);
        parsed.completion_tokens = json
            .pointer("/usage/completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        Ok(parsed)
    }
}

#[derive(Deserialize)]
struct RawReview {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    findings: Vec<RawFinding>,
}

#[derive(Deserialize)]
struct RawFinding {
    #[serde(default, alias = "file_path", alias = "path")]
    file: Option<String>,
    #[serde(default)]
    line: Option<usize>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(alias = "comment", alias = "body")]
    message: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Parse the model's JSON answer, tolerating a surrounding code fence.
pub fn parse_review_json(content: &str) -> Result<CompletionResponse> {
    let trimmed = strip_code_fence(content);
    let raw: RawReview = serde_json::from_str(trimmed).context("completion answer is not the expected JSON")?;
    let findings = raw
        .findings
        .into_iter()
        .filter(|f| !f.message.trim().is_empty())
        .map(|f| Finding {
            file_path: f.file.filter(|p| !p.is_empty()),
            line: f.line.filter(|&l| l > 0),
            severity: f.severity.as_deref().map_or(Severity::Medium, Severity::parse),
            category: f.category.unwrap_or_else(|| "general".to_string()),
            message: f.message.trim().to_string(),
            confidence: f.confidence.map(|c| c.clamp(0.0, 1.0)),
        })
        .collect();
    Ok(CompletionResponse {
        summary: raw.summary.filter(|s| !s.trim().is_empty()),
        findings,
        prompt_tokens: 0,
        completion_tokens: 0,
    })
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Create the client selected by `[completion] provider`.
pub fn create_completion_client(config: &CompletionConfig) -> Result<Arc<dyn CompletionClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledCompletionClient)),
        "openai" => Ok(Arc::new(OpenAICompletionClient::new(config)?)),
        other => bail!("Unknown completion provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_answer() {
        let answer = "```json\n{\"summary\": \"ok\", \"findings\": [\
            {\"file\": \"a.rs\", \"line\": 3, \"severity\": \"High\", \"message\": \"off by one\"},\
            {\"message\": \"   \"}]}\n```";
        let parsed = parse_review_json(answer).unwrap();
        assert_eq!(parsed.summary.as_deref(), Some("ok"));
        assert_eq!(parsed.findings.len(), 1);
        let f = &parsed.findings[0];
        assert_eq!(f.severity, Severity::High);
        assert_eq!(f.file_path.as_deref(), Some("a.rs"));
        assert_eq!(f.category, "general");
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert!(parse_review_json("Looks good to me!").is_err());
    }

    #[test]
    fn test_line_zero_becomes_file_level() {
        let parsed = parse_review_json(
            r#"{"findings": [{"file": "a.rs", "line": 0, "message": "general note"}, {"message": "overall"}]}"#,
        )
        .unwrap();
        let file_level = &parsed.findings[0];
        assert_eq!(file_level.file_path.as_deref(), Some("a.rs"));
        assert_eq!(file_level.line, None);
        assert!(!file_level.is_summary());
        assert!(parsed.findings[1].is_summary());
    }
}
