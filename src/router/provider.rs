//! The narrow chat interface every provider implements, the closed set of
//! known adapters, and a deterministic local stub for dry runs and tests.
//!
//! Failures are reported uniformly as kind + message; no transport-specific
//! error type crosses this boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use super::pricing;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    pub temperature: f64,
}

impl ChatRequest {
    pub fn simple(prompt: &str) -> Self {
        Self {
            messages: vec![ChatMessage::user(prompt)],
            system: None,
            tools: None,
            temperature: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    #[serde(default)]
    pub tool_calls: Vec<Value>,
    pub cost_usd: f64,
    pub latency_s: f64,
    pub provider: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Timeout,
    Http,
    Auth,
    RateLimited,
    Malformed,
    Cancelled,
    Scripted,
}

#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// The closed set of HTTP-backed adapters. All of them speak the
/// chat-completions wire format; only base URL, key variable and default
/// model differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    DeepSeek,
    Mistral,
    Grok,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::OpenAi,
        ProviderKind::DeepSeek,
        ProviderKind::Mistral,
        ProviderKind::Grok,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Mistral => "mistral",
            ProviderKind::Grok => "grok",
        }
    }

    pub fn api_key_var(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::DeepSeek => "DEEPSEEK_API_KEY",
            ProviderKind::Mistral => "MISTRAL_API_KEY",
            ProviderKind::Grok => "XAI_API_KEY",
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            ProviderKind::Mistral => "https://api.mistral.ai/v1",
            ProviderKind::Grok => "https://api.x.ai/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o-mini",
            ProviderKind::DeepSeek => "deepseek-chat",
            ProviderKind::Mistral => "mistral-large-latest",
            ProviderKind::Grok => "grok-2-latest",
        }
    }

    pub fn build(&self, api_key: String) -> HttpChatProvider {
        HttpChatProvider::new(
            self.name(),
            self.default_model(),
            self.base_url(),
            api_key,
        )
    }

    /// Build every provider whose API key is present in the environment.
    /// A missing key simply disables that provider.
    pub fn from_env() -> Vec<Box<dyn Provider>> {
        let mut out: Vec<Box<dyn Provider>> = Vec::new();
        for kind in Self::ALL {
            if let Ok(key) = std::env::var(kind.api_key_var()) {
                if !key.is_empty() {
                    out.push(Box::new(kind.build(key)));
                }
            }
        }
        out
    }
}

/// Chat-completions adapter over HTTP.
pub struct HttpChatProvider {
    name: String,
    model: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpChatProvider {
    pub fn new(name: &str, model: &str, base_url: &str, api_key: String) -> Self {
        Self {
            name: name.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &req.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for m in &req.messages {
            messages.push(serde_json::json!({"role": m.role, "content": m.content}));
        }
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": req.temperature,
        });
        if let Some(tools) = &req.tools {
            body["tools"] = Value::Array(tools.clone());
        }
        body
    }
}

#[async_trait]
impl Provider for HttpChatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let started = Instant::now();
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.build_body(req))
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    ProviderErrorKind::Timeout
                } else {
                    ProviderErrorKind::Http
                };
                ProviderError::new(kind, e.to_string())
            })?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ProviderError::new(
                ProviderErrorKind::Auth,
                format!("status {status}"),
            ));
        }
        if status.as_u16() == 429 {
            return Err(ProviderError::new(
                ProviderErrorKind::RateLimited,
                format!("status {status}"),
            ));
        }
        if !status.is_success() {
            return Err(ProviderError::new(
                ProviderErrorKind::Http,
                format!("status {status}"),
            ));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::new(ProviderErrorKind::Malformed, e.to_string()))?;

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let tool_calls = body["choices"][0]["message"]["tool_calls"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let tokens_in = body["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
        let tokens_out = body["usage"]["completion_tokens"].as_u64().unwrap_or(0);

        Ok(ChatResponse {
            content,
            model: self.model.clone(),
            tokens_in,
            tokens_out,
            tool_calls,
            cost_usd: pricing::estimate_cost(&self.model, tokens_in, tokens_out),
            latency_s: started.elapsed().as_secs_f64(),
            provider: self.name.clone(),
        })
    }
}

/// Deterministic in-process provider for dry runs and tests: fixed cost,
/// fixed latency, optional scripted failures.
pub struct StubProvider {
    name: String,
    cost_usd: f64,
    latency_s: f64,
    fail_next: AtomicU32,
}

impl StubProvider {
    pub fn new(name: &str, cost_usd: f64, latency_s: f64) -> Self {
        Self {
            name: name.to_string(),
            cost_usd,
            latency_s,
            fail_next: AtomicU32::new(0),
        }
    }

    /// Make the next `n` calls fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "local-stub"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::new(
                ProviderErrorKind::Scripted,
                "scripted failure",
            ));
        }
        let prompt_len: usize = req.messages.iter().map(|m| m.content.len()).sum();
        Ok(ChatResponse {
            content: format!("ack:{}", prompt_len),
            model: "local-stub".to_string(),
            tokens_in: (prompt_len / 4) as u64,
            tokens_out: 8,
            tool_calls: Vec::new(),
            cost_usd: self.cost_usd,
            latency_s: self.latency_s,
            provider: self.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_is_deterministic() {
        let stub = StubProvider::new("stub", 0.01, 0.0);
        let req = ChatRequest::simple("hello");
        let a = stub.chat(&req).await.unwrap();
        let b = stub.chat(&req).await.unwrap();
        assert_eq!(a.content, b.content);
        assert_eq!(a.cost_usd, 0.01);
        assert_eq!(a.latency_s, 0.0);
    }

    #[tokio::test]
    async fn test_stub_scripted_failures() {
        let stub = StubProvider::new("stub", 0.0, 0.0);
        stub.fail_next(2);
        let req = ChatRequest::simple("x");
        assert!(stub.chat(&req).await.is_err());
        assert!(stub.chat(&req).await.is_err());
        assert!(stub.chat(&req).await.is_ok());
    }

    #[test]
    fn test_provider_kind_metadata() {
        for kind in ProviderKind::ALL {
            assert!(!kind.name().is_empty());
            assert!(kind.base_url().starts_with("https://"));
            assert!(!kind.default_model().is_empty());
        }
    }

    #[test]
    fn test_http_body_includes_system_prompt() {
        let p = HttpChatProvider::new("openai", "gpt-4o-mini", "https://x.test/v1", "k".into());
        let mut req = ChatRequest::simple("hi");
        req.system = Some("be terse".to_string());
        let body = p.build_body(&req);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
    }
}
