use crate::bots::adapter::BotAdapter;
use crate::bots::types::{
    non_empty, AdapterConfig, CustomConfig, ParsedMessage, Platform, RichMessage, WebhookRequest,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_SIGNATURE_HEADER: &str = "x-bothook-signature";
pub const DEFAULT_TIMESTAMP_HEADER: &str = "x-bothook-timestamp";

/// 面向内部系统的通用 JSON Webhook。
///
/// 入站格式：
/// `{"type":"message","message_id":"..","user":{"id":"..","name":".."},"text":".."}`
/// 或 `{"type":"challenge","challenge":".."}`。签名为 HMAC-SHA256，
/// 覆盖 `{timestamp}.{body}`（未携带时间戳头时只覆盖 body），
/// 十六进制编码，可带 `sha256=` 前缀。
pub struct CustomAdapter {
    http: Client,
    config: CustomConfig,
}

impl CustomAdapter {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            config: CustomConfig::default(),
        }
    }

    fn signature_header(&self) -> String {
        non_empty(self.config.signature_header.as_ref())
            .unwrap_or(DEFAULT_SIGNATURE_HEADER)
            .to_ascii_lowercase()
    }

    fn timestamp_header(&self) -> String {
        non_empty(self.config.timestamp_header.as_ref())
            .unwrap_or(DEFAULT_TIMESTAMP_HEADER)
            .to_ascii_lowercase()
    }

    async fn post_reply(&self, payload: Value) -> Result<()> {
        let reply_url = non_empty(self.config.reply_url.as_ref())
            .ok_or_else(|| anyhow!("custom reply_url missing"))?;
        let mut request = self.http.post(reply_url).json(&payload);
        if let Some(token) = non_empty(self.config.reply_token.as_ref()) {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("custom outbound failed: {status} {body}"));
        }
        Ok(())
    }
}

#[async_trait]
impl BotAdapter for CustomAdapter {
    fn platform(&self) -> Platform {
        Platform::Custom
    }

    async fn init(&mut self, config: &AdapterConfig) -> Result<()> {
        let AdapterConfig::Custom(config) = config else {
            return Err(anyhow!("custom adapter cannot use {} config", config.platform()));
        };
        if non_empty(config.secret.as_ref()).is_none() {
            return Err(anyhow!("custom secret missing"));
        }
        if let Some(reply_url) = non_empty(config.reply_url.as_ref()) {
            let parsed = url::Url::parse(reply_url)
                .map_err(|err| anyhow!("custom reply_url invalid: {err}"))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(anyhow!("custom reply_url must be http or https"));
            }
        }
        self.config = config.clone();
        Ok(())
    }

    fn verify_signature(&self, request: &WebhookRequest<'_>) -> bool {
        let Some(secret) = non_empty(self.config.secret.as_ref()) else {
            return false;
        };
        let Some(signature) = request.header(&self.signature_header()) else {
            return false;
        };
        let timestamp = request.header(&self.timestamp_header());
        verify_request(secret, timestamp, request.body, signature)
    }

    fn handle_challenge(&self, request: &WebhookRequest<'_>) -> Option<String> {
        let payload = request.json()?;
        if payload.get("type").and_then(Value::as_str) != Some("challenge") {
            return None;
        }
        let challenge = payload.get("challenge").and_then(Value::as_str)?;
        Some(json!({ "challenge": challenge }).to_string())
    }

    fn parse_message(&self, request: &WebhookRequest<'_>) -> Result<Option<ParsedMessage>> {
        let payload = request
            .json()
            .ok_or_else(|| anyhow!("invalid custom payload: body is not json"))?;
        extract_message(&payload)
    }

    async fn send_reply(&self, external_user_id: &str, text: &str) -> Result<()> {
        self.post_reply(json!({ "type": "reply", "user_id": external_user_id, "text": text }))
            .await
    }

    async fn send_rich_message(&self, external_user_id: &str, message: &RichMessage) -> Result<()> {
        self.post_reply(json!({ "type": "rich", "user_id": external_user_id, "message": message }))
            .await
    }

    async fn send_error(&self, external_user_id: &str, error: &str) -> Result<()> {
        self.post_reply(json!({ "type": "error", "user_id": external_user_id, "error": error }))
            .await
    }
}

pub fn sign_payload(secret: &str, timestamp: Option<&str>, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    if let Some(timestamp) = timestamp {
        mac.update(timestamp.as_bytes());
        mac.update(b".");
    }
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_request(secret: &str, timestamp: Option<&str>, body: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    if let Some(timestamp) = timestamp {
        mac.update(timestamp.as_bytes());
        mac.update(b".");
    }
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub fn extract_message(payload: &Value) -> Result<Option<ParsedMessage>> {
    let kind = payload.get("type").and_then(Value::as_str).unwrap_or("message");
    if kind != "message" {
        return Ok(None);
    }
    let user = payload
        .get("user")
        .ok_or_else(|| anyhow!("invalid custom payload: missing user"))?;
    let user_id = match user.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err(anyhow!("invalid custom payload: missing user.id")),
    };
    let text = payload
        .get("text")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    if text.is_empty() {
        return Ok(None);
    }
    let message_id = match payload.get("message_id") {
        Some(Value::String(id)) if !id.trim().is_empty() => Some(id.trim().to_string()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    };
    Ok(Some(ParsedMessage {
        external_user_id: user_id,
        external_user_name: user.get("name").and_then(Value::as_str).map(str::to_string),
        text: text.to_string(),
        message_type: payload
            .get("message_type")
            .and_then(Value::as_str)
            .unwrap_or("text")
            .to_string(),
        message_id,
        raw_payload: payload.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};
    use std::collections::HashMap;

    async fn adapter() -> CustomAdapter {
        let mut adapter = CustomAdapter::new(Client::new());
        adapter
            .init(&AdapterConfig::Custom(CustomConfig {
                secret: Some("shh".to_string()),
                ..Default::default()
            }))
            .await
            .unwrap();
        adapter
    }

    #[tokio::test]
    async fn signature_with_and_without_timestamp() {
        let adapter = adapter().await;
        let body = br#"{"type":"message","user":{"id":"u1"},"text":"hi"}"#;
        let query = HashMap::new();

        let mut headers = HeaderMap::new();
        let signature = sign_payload("shh", Some("1710000000"), body).unwrap();
        headers.insert(
            DEFAULT_SIGNATURE_HEADER,
            HeaderValue::from_str(&format!("sha256={signature}")).unwrap(),
        );
        headers.insert(DEFAULT_TIMESTAMP_HEADER, HeaderValue::from_static("1710000000"));
        assert!(adapter.verify_signature(&WebhookRequest::new(body, &headers, &query)));

        let mut headers = HeaderMap::new();
        let signature = sign_payload("shh", None, body).unwrap();
        headers.insert(
            DEFAULT_SIGNATURE_HEADER,
            HeaderValue::from_str(&signature).unwrap(),
        );
        assert!(adapter.verify_signature(&WebhookRequest::new(body, &headers, &query)));

        headers.insert(DEFAULT_TIMESTAMP_HEADER, HeaderValue::from_static("1"));
        assert!(!adapter.verify_signature(&WebhookRequest::new(body, &headers, &query)));
    }

    #[tokio::test]
    async fn challenge_envelope_is_echoed() {
        let adapter = adapter().await;
        let headers = HeaderMap::new();
        let query = HashMap::new();
        let request =
            WebhookRequest::new(br#"{"type":"challenge","challenge":"abc"}"#, &headers, &query);
        assert_eq!(
            adapter.handle_challenge(&request).as_deref(),
            Some(r#"{"challenge":"abc"}"#)
        );
    }

    #[test]
    fn extract_message_reads_envelope() {
        let payload = json!({
            "type": "message",
            "message_id": 91,
            "user": { "id": "u1", "name": "Ann" },
            "text": " /orders ",
        });
        let parsed = extract_message(&payload).unwrap().unwrap();
        assert_eq!(parsed.message_id.as_deref(), Some("91"));
        assert_eq!(parsed.text, "/orders");
        assert_eq!(parsed.external_user_name.as_deref(), Some("Ann"));
    }

    #[test]
    fn non_message_envelopes_are_skipped() {
        assert!(extract_message(&json!({ "type": "delivery_receipt" }))
            .unwrap()
            .is_none());
        assert!(extract_message(&json!({ "type": "message", "user": { "id": "u" }, "text": "" }))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn init_rejects_non_http_reply_url() {
        let mut adapter = CustomAdapter::new(Client::new());
        let config = |reply_url: &str| {
            AdapterConfig::Custom(CustomConfig {
                secret: Some("shh".to_string()),
                reply_url: Some(reply_url.to_string()),
                ..Default::default()
            })
        };
        assert!(adapter.init(&config("ftp://files.local/in")).await.is_err());
        assert!(adapter.init(&config("not a url")).await.is_err());
        assert!(adapter
            .init(&config("https://hooks.example.com/reply"))
            .await
            .is_ok());
    }
}
