//! LLM backend trait and concrete implementations.
//!
//! Backends:
//!   OllamaBackend           — local Ollama (OpenAI-compatible)
//!   OpenAiBackend           — OpenAI API (gpt-4o, gpt-4o-mini, …)
//!   OpenAiCompatibleBackend — any OpenAI-compatible endpoint (LMStudio,
//!                             TogetherAI, Groq, OpenRouter, vLLM, …)
//!   AnthropicBackend        — Anthropic Messages API (claude-*)
//!
//! Structured output: when `LlmRequest::response_schema` is set, OpenAI-style
//! backends send it as `response_format: json_schema`; Anthropic has no such
//! switch, so the schema is appended to the system prompt instead.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
    #[error("API error [{status}]: {message}")]
    ApiError { status: u16, message: String },
}

impl LlmError {
    /// True when the request hit its timeout before a response arrived.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LlmError::Http(e) if e.is_timeout())
    }

    /// HTTP status behind this error, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            LlmError::RateLimitExceeded => Some(429),
            LlmError::ApiError { status, .. } => Some(*status),
            LlmError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

// ── Request / Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,   // "system" | "user" | "assistant"
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// JSON schema the answer must conform to.
    pub response_schema: Option<serde_json::Value>,
    /// Name reported alongside `response_schema`.
    pub schema_name: Option<String>,
}

impl LlmRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages, ..Default::default() }
    }

    pub fn with_schema(mut self, name: impl Into<String>, schema: serde_json::Value) -> Self {
        self.schema_name = Some(name.into());
        self.response_schema = Some(schema);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

// ── Trait ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError>;
    fn model_id(&self) -> &str;
    /// Host the backend talks to; used as the rate-limiting key.
    fn host(&self) -> &str;
    fn is_local(&self) -> bool;
    fn max_context_tokens(&self) -> usize;
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn parse_openai_response(json: &serde_json::Value, fallback_model: &str) -> LlmResponse {
    LlmResponse {
        content: json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string(),
        model: json["model"]
            .as_str()
            .unwrap_or(fallback_model)
            .to_string(),
        prompt_tokens:     json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
    }
}

async fn check_response_status(resp: reqwest::Response) -> Result<serde_json::Value, LlmError> {
    let status = resp.status().as_u16();
    let text = resp.text().await?;
    if status == 429 {
        debug!("LLM backend rate limited");
        return Err(LlmError::RateLimitExceeded);
    }
    if status >= 400 {
        // Gateways return HTML on 5xx; keep the status even when the body is junk
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|body| {
                body["error"]["message"]
                    .as_str()
                    .or_else(|| body["message"].as_str())
                    .map(String::from)
            })
            .unwrap_or_else(|| "unknown API error".to_string());
        warn!(status, %message, "LLM backend returned an error");
        return Err(LlmError::ApiError { status, message });
    }
    Ok(serde_json::from_str(&text)?)
}

fn openai_body(req: &LlmRequest, default_model: &str) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model":       req.model.as_deref().unwrap_or(default_model),
        "messages":    req.messages,
        "max_tokens":  req.max_tokens.unwrap_or(4096),
        "temperature": req.temperature.unwrap_or(0.0),
    });
    if let Some(schema) = &req.response_schema {
        body["response_format"] = serde_json::json!({
            "type": "json_schema",
            "json_schema": {
                "name":   req.schema_name.as_deref().unwrap_or("response"),
                "schema": schema,
            }
        });
    }
    body
}

/// Upper bound on one completion request, connect to last byte.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

fn host_of(base_url: &str) -> String {
    url::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_else(|| base_url.to_string())
}

// ── 1. Ollama (local) ─────────────────────────────────────────────────────────

pub struct OllamaBackend {
    pub base_url: String,
    pub model: String,
    host: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let host = host_of(&base_url);
        Self {
            base_url,
            model: model.into(),
            host,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = openai_body(&req, &self.model);
        let resp = self.client.post(&url).timeout(self.timeout).json(&body).send().await?;
        let json = check_response_status(resp).await?;
        Ok(parse_openai_response(&json, &self.model))
    }

    fn model_id(&self) -> &str { &self.model }
    fn host(&self) -> &str { &self.host }
    fn is_local(&self) -> bool { true }
    fn max_context_tokens(&self) -> usize { 32768 }
}

// ── 2. OpenAI ─────────────────────────────────────────────────────────────────

pub struct OpenAiBackend {
    pub model: String,
    api_key: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let body = openai_body(&req, &self.model);
        let resp = self.client
            .post("https://api.openai.com/v1/chat/completions")
            .timeout(self.timeout)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let json = check_response_status(resp).await?;
        Ok(parse_openai_response(&json, &self.model))
    }

    fn model_id(&self) -> &str { &self.model }
    fn host(&self) -> &str { "api.openai.com" }
    fn is_local(&self) -> bool { false }
    fn max_context_tokens(&self) -> usize { 128_000 }
}

// ── 3. OpenAI-Compatible (LMStudio, TogetherAI, Groq, OpenRouter, vLLM, …) ──

pub struct OpenAiCompatibleBackend {
    pub base_url: String,
    pub model: String,
    host: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatibleBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        let base_url = base_url.into();
        let host = host_of(&base_url);
        Self {
            base_url,
            model: model.into(),
            host,
            api_key,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(k) => req.bearer_auth(k),
            None    => req,
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = openai_body(&req, &self.model);
        let resp = self.auth(self.client.post(&url).timeout(self.timeout)).json(&body).send().await?;
        let json = check_response_status(resp).await?;
        Ok(parse_openai_response(&json, &self.model))
    }

    fn model_id(&self) -> &str { &self.model }
    fn host(&self) -> &str { &self.host }
    fn is_local(&self) -> bool { false }
    fn max_context_tokens(&self) -> usize { 128_000 }
}

// ── 4. Anthropic (claude-*) ───────────────────────────────────────────────────

pub struct AnthropicBackend {
    pub model: String,
    api_key: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Anthropic takes the system prompt separately; the response schema, if
/// any, is appended to it.
fn anthropic_system(req: &LlmRequest) -> String {
    let mut system = req.messages.iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    if let Some(schema) = &req.response_schema {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str("Respond with a single JSON object conforming to this JSON schema:\n");
        system.push_str(&schema.to_string());
    }
    system
}

#[async_trait]
impl LlmBackend for AnthropicBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let system = anthropic_system(&req);

        let messages: Vec<serde_json::Value> = req.messages.iter()
            .filter(|m| m.role != "system")
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();

        let model = req.model.as_deref().unwrap_or(&self.model);
        let max_tokens = req.max_tokens.unwrap_or(4096);

        let mut body = serde_json::json!({
            "model":      model,
            "messages":   messages,
            "max_tokens": max_tokens,
            "temperature": req.temperature.unwrap_or(0.0),
        });
        if !system.is_empty() {
            body["system"] = serde_json::Value::String(system);
        }

        let resp = self.client
            .post("https://api.anthropic.com/v1/messages")
            .timeout(self.timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let json = check_response_status(resp).await?;

        let content = json["content"]
            .as_array()
            .and_then(|blocks| blocks.first())
            .and_then(|b| b["text"].as_str())
            .unwrap_or("")
            .to_string();

        Ok(LlmResponse {
            content,
            model: json["model"].as_str().unwrap_or(model).to_string(),
            prompt_tokens:     json["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: json["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }

    fn model_id(&self) -> &str { &self.model }
    fn host(&self) -> &str { "api.anthropic.com" }
    fn is_local(&self) -> bool { false }
    fn max_context_tokens(&self) -> usize { 200_000 }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_backend_is_not_local() {
        let b = OpenAiBackend::new("sk-test", "gpt-4o");
        assert!(!b.is_local());
        assert_eq!(b.model_id(), "gpt-4o");
        assert_eq!(b.host(), "api.openai.com");
    }

    #[test]
    fn test_ollama_is_local_and_keyed_by_host() {
        let b = OllamaBackend::new("http://localhost:11434", "llama3:8b");
        assert!(b.is_local());
        assert_eq!(b.host(), "localhost");
    }

    #[test]
    fn test_openai_compatible_with_no_key() {
        let b = OpenAiCompatibleBackend::new("http://127.0.0.1:1234/", "local-model", None);
        assert_eq!(b.model_id(), "local-model");
        assert_eq!(b.host(), "127.0.0.1");
    }

    #[test]
    fn test_openai_body_carries_schema() {
        let req = LlmRequest::new(vec![Message::user("hi")])
            .with_schema("fields", serde_json::json!({"type": "object"}));
        let body = openai_body(&req, "gpt-4o-mini");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "fields");
        assert_eq!(body["model"], "gpt-4o-mini");
    }

    #[test]
    fn test_openai_body_without_schema_has_no_response_format() {
        let body = openai_body(&LlmRequest::new(vec![Message::user("hi")]), "m");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_anthropic_system_appends_schema() {
        let req = LlmRequest::new(vec![Message::system("Be terse."), Message::user("hi")])
            .with_schema("fields", serde_json::json!({"type": "object"}));
        let system = anthropic_system(&req);
        assert!(system.starts_with("Be terse."));
        assert!(system.contains("{\"type\":\"object\"}"));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(LlmError::RateLimitExceeded.status(), Some(429));
        let e = LlmError::ApiError { status: 503, message: "overloaded".into() };
        assert_eq!(e.status(), Some(503));
        assert_eq!(LlmError::Unavailable("x".into()).status(), None);
        assert!(!LlmError::RateLimitExceeded.is_timeout());
    }

    #[tokio::test]
    async fn test_stalled_server_times_out() {
        // Accepts connections (via the backlog) but never answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let backend = OllamaBackend::new(url, "llama3:8b").with_timeout(Duration::from_millis(200));

        let err = backend.complete(LlmRequest::new(vec![Message::user("hi")])).await.unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err}");
        assert_eq!(err.status(), None);
        drop(listener);
    }
}
