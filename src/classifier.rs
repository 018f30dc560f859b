//! Report classification.
//!
//! `RemoteValidator` sends the description to an OpenAI-compatible
//! chat-completions endpoint and parses a strict-JSON verdict out of the
//! reply. `ValidatorStack` wraps it and absorbs every failure mode into the
//! deterministic [`FallbackValidator`], so callers always get a `Verdict`
//! back, never an error.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fallback::FallbackValidator;
use crate::models::{Severity, TechnicalContext, Verdict};

pub const DEFAULT_VALIDATION_TIMEOUT_SECS: u64 = 10;

const SYSTEM_PROMPT: &str = r#"You are a bug report validator for an e-commerce platform. Your job is to:
1. Determine if a bug report is valid and meaningful
2. Filter out gibberish, spam, test submissions, and low-quality reports
3. Categorize valid reports and generate clear titles
4. Sanitize sensitive information from descriptions

Reject reports if they are:
- Gibberish (random characters, keyboard mashing like "asdfasdf")
- Test content ("test", "testing 123", etc.)
- Spam or promotional content
- Empty or extremely short without meaningful content
- Only emojis or special characters
- Not describing a technical issue

Flag for clarification if:
- Description is too vague ("it doesn't work")
- Missing critical information (what page, what action, what happened)
- Unclear what the expected behavior should be

Accept reports if they:
- Clearly describe what went wrong
- Include context about what user was trying to do
- Describe the issue in sufficient detail for investigation
- Are written in good faith attempt to report a real problem

Return JSON with:
- valid: boolean
- quality_score: number (0-100)
- category: string (e.g., "ui", "payment", "performance", "data", "authentication", "other")
- severity: string ("low", "medium", "high", "critical")
- title: string (clear, concise title for the bug)
- sanitized_description: string (description with sensitive info redacted)
- rejection_reason: string (if valid is false)
- needs_clarification: boolean
- clarification_message: string (if needs_clarification is true)"#;

#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub description: String,
    pub page_url: Option<String>,
    pub technical_context: TechnicalContext,
}

/// Strategy seam between the orchestrator and whichever classification path
/// ends up running. Implementations never surface errors; the worst case is
/// a rejection verdict.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, req: &ValidationRequest) -> Verdict;
}

#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model returned status {0}")]
    Status(u16),
    #[error("model reply had no content")]
    Empty,
    #[error("model reply was not parsable JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: serde_json::Value,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Deserialize)]
struct ChatReplyMessage {
    content: Option<String>,
}

/// Raw verdict shape as the model emits it; lenient about omitted fields.
#[derive(Deserialize)]
struct RawVerdict {
    #[serde(default)]
    valid: bool,
    quality_score: Option<f64>,
    category: Option<String>,
    severity: Option<String>,
    title: Option<String>,
    sanitized_description: Option<String>,
    rejection_reason: Option<String>,
    #[serde(default)]
    needs_clarification: bool,
    clarification_message: Option<String>,
}

pub struct RemoteValidator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl RemoteValidator {
    /// Returns `None` when no API key is configured; the stack then runs the
    /// fallback path directly.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_ACCESS_TOKEN").ok()?;
        let base_url = std::env::var("OPENAI_API_BASE")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model =
            std::env::var("BUG_REPORT_AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let timeout_secs = std::env::var("BUG_REPORT_AI_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_VALIDATION_TIMEOUT_SECS);
        Some(Self::new(base_url, api_key, model, Duration::from_secs(timeout_secs)))
    }

    pub fn new(base_url: String, api_key: String, model: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            model,
            timeout,
        }
    }

    async fn validate_remote(&self, req: &ValidationRequest) -> Result<Verdict, RemoteError> {
        let user = user_prompt(req);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: SYSTEM_PROMPT },
                ChatMessage { role: "user", content: &user },
            ],
            response_format: serde_json::json!({ "type": "json_object" }),
            temperature: 0.3,
        };

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RemoteError::Status(resp.status().as_u16()));
        }

        let reply: ChatResponse = resp.json().await?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(RemoteError::Empty)?;

        let raw: RawVerdict = serde_json::from_str(extract_json(&content))?;
        Ok(build_verdict(raw, &req.description))
    }
}

/// Models wrap JSON in markdown fences or prefix it with prose; take the
/// slice between the first `{` and the last `}` before parsing.
pub fn extract_json(reply: &str) -> &str {
    match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if end > start => &reply[start..=end],
        _ => reply,
    }
}

fn user_prompt(req: &ValidationRequest) -> String {
    let mut prompt = format!("Bug report description: {}", req.description);
    if let Some(url) = &req.page_url {
        prompt.push_str(&format!("\nPage URL: {url}"));
    }
    if let Some(browser) = &req.technical_context.browser {
        prompt.push_str(&format!("\nBrowser: {browser}"));
    }
    if let Some(os) = &req.technical_context.os {
        prompt.push_str(&format!("\nOS: {os}"));
    }
    if let Some(viewport) = &req.technical_context.viewport {
        prompt.push_str(&format!("\nViewport: {viewport}"));
    }
    prompt
}

fn build_verdict(raw: RawVerdict, description: &str) -> Verdict {
    // A clarification flag always wins over the model's valid bit: the report
    // is stored but blocked from publication.
    Verdict {
        valid: raw.valid && !raw.needs_clarification,
        quality_score: raw.quality_score,
        category: raw.category,
        severity: raw.severity.as_deref().and_then(Severity::parse),
        title: raw.title,
        sanitized_description: raw
            .sanitized_description
            .or_else(|| Some(description.to_string())),
        rejection_reason: raw.rejection_reason,
        needs_clarification: raw.needs_clarification,
        clarification_message: raw.clarification_message,
    }
}

/// Remote-first classification with the deterministic tree as the safety
/// valve. This is what the orchestrator holds.
pub struct ValidatorStack {
    remote: Option<RemoteValidator>,
}

impl ValidatorStack {
    pub fn from_env() -> Self {
        Self { remote: RemoteValidator::from_env() }
    }

    /// Deterministic-only stack, used in tests and when no model is
    /// configured.
    pub fn fallback_only() -> Self {
        Self { remote: None }
    }

    pub fn with_remote(remote: RemoteValidator) -> Self {
        Self { remote: Some(remote) }
    }
}

#[async_trait]
impl Validator for ValidatorStack {
    async fn validate(&self, req: &ValidationRequest) -> Verdict {
        if let Some(remote) = &self.remote {
            match remote.validate_remote(req).await {
                Ok(verdict) => return verdict,
                Err(e) => {
                    warn!("remote validation failed, using fallback: {e}");
                    metrics::increment_counter!("bugrelay_classifier_fallbacks_total");
                }
            }
        }
        FallbackValidator::classify(&req.description)
    }
}
