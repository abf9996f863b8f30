// OpenAI 兼容的 chat/completions 客户端，作为机器人的 AI 提供方。
use crate::bots::responder::AiProvider;
use crate::core::config::LlmProviderConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    config: LlmProviderConfig,
}

impl LlmClient {
    pub fn new(http: Client, config: LlmProviderConfig) -> Self {
        Self { http, config }
    }

    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut request = self
            .http
            .post(self.endpoint())
            .json(&self.build_payload(messages));
        if let Some(api_key) = self
            .config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            request = request.bearer_auth(api_key);
        }
        if let Some(timeout_s) = self.config.timeout_s.filter(|value| *value > 0) {
            request = request.timeout(Duration::from_secs(timeout_s));
        }
        let response = request.send().await?;
        let status = response.status();
        let body_text = response.text().await.context("read llm response body")?;
        let body = match serde_json::from_str::<Value>(&body_text) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    "LLM response json parse failed: {err}, body={}",
                    truncate_text(&body_text, 2048)
                );
                Value::Null
            }
        };
        if !status.is_success() {
            let detail = if body.is_null() {
                json!({ "raw": truncate_text(&body_text, 2048) })
            } else {
                body
            };
            return Err(anyhow!("LLM request failed: {status} {detail}"));
        }
        let content = body
            .get("choices")
            .and_then(|value| value.get(0))
            .and_then(|value| value.get("message"))
            .and_then(|value| value.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        if content.is_empty() {
            return Err(anyhow!(
                "LLM response has no content: {}",
                truncate_text(&body_text, 2048)
            ));
        }
        Ok(content.to_string())
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    pub fn build_payload(&self, messages: &[ChatMessage]) -> Value {
        let mut payload = json!({
            "model": self.config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            "messages": messages,
            "temperature": self.config.temperature.unwrap_or(0.3),
            "stream": false,
        });
        if let Some(max_output) = self.config.max_output.filter(|value| *value > 0) {
            payload["max_tokens"] = json!(max_output);
        }
        payload
    }
}

#[async_trait]
impl AiProvider for LlmClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.complete(&[ChatMessage::user(prompt)]).await
    }
}

pub fn is_llm_configured(config: &LlmProviderConfig) -> bool {
    config
        .model
        .as_ref()
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
}

fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut output: String = text.chars().take(max_chars).collect();
    output.push_str("...");
    output
}
