use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{Completion, CompletionRequest, ContentBlock, LlmClient};
use crate::errors::LlmError;

pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const API_VERSION: &str = "2023-06-01";

/// Messages API client.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            model: model.into(),
            max_retries: 3,
        }
    }

    /// Build a client from an optional configured key, falling back to the environment.
    pub fn from_key_or_env(api_key: Option<&str>, model: &str) -> Result<Self, LlmError> {
        let key = match api_key {
            Some(k) if !k.is_empty() => k.to_string(),
            _ => std::env::var(API_KEY_ENV).map_err(|_| LlmError::MissingApiKey {
                env_var: API_KEY_ENV,
            })?,
        };
        Ok(Self::new(key, model))
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "max_tokens": request.max_tokens,
            "messages": request.messages,
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
        }
        body
    }

    async fn send_once(&self, body: &serde_json::Value) -> Result<Completion, LlmError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(text) => text,
                Err(e) => format!("<failed to read error body: {e}>"),
            };
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        let parsed: MessagesResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::Decode(e.to_string()))?;
        Ok(Completion {
            content: parsed.content,
            stop_reason: parsed.stop_reason,
        })
    }
}

/// Exponential backoff: 1s, 2s, 4s, ... capped at 30s.
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs((1u64 << attempt.min(5)).min(30))
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let body = self.build_body(&request);
        let mut attempt = 0;
        loop {
            match self.send_once(&body).await {
                Ok(completion) => return Ok(completion),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = backoff(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "LLM request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Message, ToolDefinition};

    #[test]
    fn body_includes_system_and_tools_only_when_set() {
        let client = AnthropicClient::new("key", "claude-test");
        let bare = CompletionRequest::new(vec![Message::user("hi")], 100);
        let body = client.build_body(&bare);
        assert_eq!(body["model"], "claude-test");
        assert_eq!(body["max_tokens"], 100);
        assert!(body.get("system").is_none());
        assert!(body.get("tools").is_none());

        let full = CompletionRequest::new(vec![Message::user("hi")], 100)
            .with_system("be terse")
            .with_tools(vec![ToolDefinition {
                name: "confirm_state".into(),
                description: "confirm".into(),
                input_schema: json!({"type": "object", "properties": {}}),
            }])
            .with_model(Some("claude-other".into()));
        let body = client.build_body(&full);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["tools"][0]["name"], "confirm_state");
        assert_eq!(body["model"], "claude-other");
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(4));
        assert_eq!(backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn api_base_trailing_slash_is_trimmed() {
        let client = AnthropicClient::new("key", "m").with_api_base("http://localhost:9999/");
        assert_eq!(client.api_base, "http://localhost:9999");
    }

    #[test]
    fn explicit_key_wins_over_environment() {
        let client = AnthropicClient::from_key_or_env(Some("explicit"), "m").unwrap();
        assert_eq!(client.api_key, "explicit");
    }
}
