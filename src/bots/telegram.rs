use crate::bots::adapter::BotAdapter;
use crate::bots::types::{
    constant_time_eq, non_empty, resolve_api_base, AdapterConfig, ParsedMessage, Platform,
    RichMessage, TelegramConfig, WebhookRequest,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

const DEFAULT_API_BASE: &str = "api.telegram.org";
const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";
const MAX_TEXT_CHARS: usize = 4096;

pub struct TelegramAdapter {
    http: Client,
    config: TelegramConfig,
}

impl TelegramAdapter {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            config: TelegramConfig::default(),
        }
    }

    async fn call_api(&self, method: &str, payload: &Value) -> Result<()> {
        let token = non_empty(self.config.bot_token.as_ref())
            .ok_or_else(|| anyhow!("telegram bot_token missing"))?;
        let base_url = resolve_api_base(self.config.api_base.as_ref(), DEFAULT_API_BASE);
        let response = self
            .http
            .post(format!("{base_url}/bot{token}/{method}"))
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() || body.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = body
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(anyhow!("telegram {method} failed: {status} {description}"));
        }
        Ok(())
    }
}

#[async_trait]
impl BotAdapter for TelegramAdapter {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    async fn init(&mut self, config: &AdapterConfig) -> Result<()> {
        let AdapterConfig::Telegram(config) = config else {
            return Err(anyhow!(
                "telegram adapter cannot use {} config",
                config.platform()
            ));
        };
        if non_empty(config.bot_token.as_ref()).is_none() {
            return Err(anyhow!("telegram bot_token missing"));
        }
        self.config = config.clone();
        Ok(())
    }

    /// Telegram 不做签名，`setWebhook` 时设置的可选密钥会通过请求头带回。
    fn verify_signature(&self, request: &WebhookRequest<'_>) -> bool {
        let Some(expected) = non_empty(self.config.secret_token.as_ref()) else {
            return true;
        };
        request
            .header(SECRET_HEADER)
            .map(|provided| constant_time_eq(provided.as_bytes(), expected.as_bytes()))
            .unwrap_or(false)
    }

    fn parse_message(&self, request: &WebhookRequest<'_>) -> Result<Option<ParsedMessage>> {
        let update = request
            .json()
            .ok_or_else(|| anyhow!("invalid telegram payload: body is not json"))?;
        extract_update(&update)
    }

    async fn send_reply(&self, external_user_id: &str, text: &str) -> Result<()> {
        let chat_id = external_user_id.trim();
        if chat_id.is_empty() {
            return Err(anyhow!("telegram outbound chat id missing"));
        }
        let text = if text.trim().is_empty() {
            "(empty message)".to_string()
        } else {
            truncate_text(text)
        };
        self.call_api("sendMessage", &json!({ "chat_id": chat_id, "text": text }))
            .await
    }

    async fn send_rich_message(&self, external_user_id: &str, message: &RichMessage) -> Result<()> {
        let chat_id = external_user_id.trim();
        if chat_id.is_empty() {
            return Err(anyhow!("telegram outbound chat id missing"));
        }
        let mut payload = json!({
            "chat_id": chat_id,
            "text": truncate_text(&render_html(message)),
            "parse_mode": "HTML",
        });
        if !message.buttons.is_empty() {
            let rows: Vec<Value> = message
                .buttons
                .iter()
                .map(|button| json!([{ "text": button.label, "url": button.url }]))
                .collect();
            payload["reply_markup"] = json!({ "inline_keyboard": rows });
        }
        self.call_api("sendMessage", &payload).await
    }
}

pub fn extract_update(update: &Value) -> Result<Option<ParsedMessage>> {
    let update_id = update
        .get("update_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("invalid telegram payload: missing update_id"))?;

    let (from, text, message_type) = if let Some(message) = update.get("message") {
        let Some(text) = message.get("text").and_then(Value::as_str) else {
            return Ok(None);
        };
        let message_type = if text.trim_start().starts_with('/') {
            "command"
        } else {
            "text"
        };
        (message.get("from"), text.to_string(), message_type)
    } else if let Some(callback) = update.get("callback_query") {
        let Some(data) = callback.get("data").and_then(Value::as_str) else {
            return Ok(None);
        };
        (callback.get("from"), data.to_string(), "callback")
    } else {
        return Ok(None);
    };

    let from = from.ok_or_else(|| anyhow!("invalid telegram payload: missing from"))?;
    if from.get("is_bot").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(None);
    }
    let user_id = from
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("invalid telegram payload: missing from.id"))?;
    let text = text.trim().to_string();
    if text.is_empty() {
        return Ok(None);
    }
    let user_name = from
        .get("username")
        .or_else(|| from.get("first_name"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Some(ParsedMessage {
        external_user_id: user_id.to_string(),
        external_user_name: user_name,
        text,
        message_type: message_type.to_string(),
        message_id: Some(update_id.to_string()),
        raw_payload: update.to_string(),
    }))
}

fn render_html(message: &RichMessage) -> String {
    let mut lines = Vec::new();
    if let Some(title) = message.title.as_deref().filter(|value| !value.trim().is_empty()) {
        lines.push(format!("<b>{}</b>", escape_html(title.trim())));
    }
    if !message.text.trim().is_empty() {
        lines.push(escape_html(message.text.trim()));
    }
    for field in &message.fields {
        lines.push(format!(
            "<b>{}</b>: {}",
            escape_html(&field.name),
            escape_html(&field.value)
        ));
    }
    lines.join("\n")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn truncate_text(text: &str) -> String {
    text.chars().take(MAX_TEXT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};
    use std::collections::HashMap;

    async fn adapter(secret: Option<&str>) -> TelegramAdapter {
        let mut adapter = TelegramAdapter::new(Client::new());
        adapter
            .init(&AdapterConfig::Telegram(TelegramConfig {
                bot_token: Some("123:abc".to_string()),
                secret_token: secret.map(str::to_string),
                api_base: None,
            }))
            .await
            .unwrap();
        adapter
    }

    #[tokio::test]
    async fn secret_header_must_match() {
        let adapter = adapter(Some("s3cret")).await;
        let query = HashMap::new();
        let mut headers = HeaderMap::new();
        assert!(!adapter.verify_signature(&WebhookRequest::new(b"{}", &headers, &query)));
        headers.insert(SECRET_HEADER, HeaderValue::from_static("wrong"));
        assert!(!adapter.verify_signature(&WebhookRequest::new(b"{}", &headers, &query)));
        headers.insert(SECRET_HEADER, HeaderValue::from_static("s3cret"));
        assert!(adapter.verify_signature(&WebhookRequest::new(b"{}", &headers, &query)));
    }

    #[tokio::test]
    async fn missing_secret_accepts_all() {
        let adapter = adapter(None).await;
        let headers = HeaderMap::new();
        let query = HashMap::new();
        assert!(adapter.verify_signature(&WebhookRequest::new(b"{}", &headers, &query)));
    }

    #[test]
    fn text_message_uses_update_id() {
        let update = json!({
            "update_id": 5001,
            "message": {
                "message_id": 12,
                "from": { "id": 777, "is_bot": false, "first_name": "Li", "username": "li" },
                "chat": { "id": 777, "type": "private" },
                "text": "/orders status=open"
            }
        });
        let parsed = extract_update(&update).unwrap().unwrap();
        assert_eq!(parsed.external_user_id, "777");
        assert_eq!(parsed.message_id.as_deref(), Some("5001"));
        assert_eq!(parsed.message_type, "command");
        assert_eq!(parsed.external_user_name.as_deref(), Some("li"));
    }

    #[test]
    fn non_text_updates_are_skipped() {
        let sticker = json!({
            "update_id": 5002,
            "message": { "from": { "id": 1 }, "sticker": { "file_id": "x" } }
        });
        assert!(extract_update(&sticker).unwrap().is_none());
        let member = json!({ "update_id": 5003, "my_chat_member": {} });
        assert!(extract_update(&member).unwrap().is_none());
    }

    #[test]
    fn render_html_escapes_content() {
        let message = RichMessage {
            title: Some("a<b".to_string()),
            text: "x & y".to_string(),
            ..Default::default()
        };
        assert_eq!(render_html(&message), "<b>a&lt;b</b>\nx &amp; y");
    }
}
