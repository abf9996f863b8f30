use crate::bots::adapter::BotAdapter;
use crate::bots::types::{
    non_empty, resolve_api_base, AdapterConfig, ParsedMessage, Platform, RichMessage, SlackConfig,
    WebhookRequest,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_API_BASE: &str = "slack.com/api";
const MAX_CLOCK_SKEW_S: u64 = 300;

pub struct SlackAdapter {
    http: Client,
    config: SlackConfig,
}

impl SlackAdapter {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            config: SlackConfig::default(),
        }
    }

    async fn post_message(&self, external_user_id: &str, mut payload: Value) -> Result<()> {
        let channel = external_user_id.trim();
        if channel.is_empty() {
            return Err(anyhow!("slack outbound user id missing"));
        }
        let token = non_empty(self.config.bot_token.as_ref())
            .ok_or_else(|| anyhow!("slack bot_token missing"))?;
        payload["channel"] = Value::String(channel.to_string());
        let base_url = resolve_api_base(self.config.api_base.as_ref(), DEFAULT_API_BASE);
        let response = self
            .http
            .post(format!("{base_url}/chat.postMessage"))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("slack outbound failed: {status} {body}"));
        }
        // Slack 的接口级失败也返回 200，需检查 `ok: false`。
        let body: Value = response.json().await?;
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = body.get("error").and_then(Value::as_str).unwrap_or("unknown");
            return Err(anyhow!("slack outbound failed: {error}"));
        }
        Ok(())
    }
}

#[async_trait]
impl BotAdapter for SlackAdapter {
    fn platform(&self) -> Platform {
        Platform::Slack
    }

    async fn init(&mut self, config: &AdapterConfig) -> Result<()> {
        let AdapterConfig::Slack(config) = config else {
            return Err(anyhow!("slack adapter cannot use {} config", config.platform()));
        };
        if non_empty(config.signing_secret.as_ref()).is_none() {
            return Err(anyhow!("slack signing_secret missing"));
        }
        self.config = config.clone();
        Ok(())
    }

    fn verify_signature(&self, request: &WebhookRequest<'_>) -> bool {
        let Some(secret) = non_empty(self.config.signing_secret.as_ref()) else {
            return false;
        };
        let (Some(signature), Some(timestamp)) = (
            request.header("x-slack-signature"),
            request.header("x-slack-request-timestamp"),
        ) else {
            return false;
        };
        verify_request(
            secret,
            timestamp,
            request.body,
            signature,
            chrono::Utc::now().timestamp(),
        )
    }

    fn handle_challenge(&self, request: &WebhookRequest<'_>) -> Option<String> {
        let payload = request.json()?;
        if payload.get("type").and_then(Value::as_str) != Some("url_verification") {
            return None;
        }
        if !self.verify_signature(request) {
            return None;
        }
        payload
            .get("challenge")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn parse_message(&self, request: &WebhookRequest<'_>) -> Result<Option<ParsedMessage>> {
        let payload = request
            .json()
            .ok_or_else(|| anyhow!("invalid slack payload: body is not json"))?;
        extract_event(&payload)
    }

    async fn send_reply(&self, external_user_id: &str, text: &str) -> Result<()> {
        self.post_message(external_user_id, json!({ "text": text }))
            .await
    }

    async fn send_rich_message(&self, external_user_id: &str, message: &RichMessage) -> Result<()> {
        let mut blocks = Vec::new();
        if let Some(title) = message.title.as_deref().filter(|value| !value.trim().is_empty()) {
            blocks.push(json!({
                "type": "header",
                "text": { "type": "plain_text", "text": title.trim() }
            }));
        }
        if !message.text.trim().is_empty() {
            blocks.push(json!({
                "type": "section",
                "text": { "type": "mrkdwn", "text": message.text.trim() }
            }));
        }
        for chunk in message.fields.chunks(10) {
            let fields: Vec<Value> = chunk
                .iter()
                .map(|field| json!({ "type": "mrkdwn", "text": format!("*{}*\n{}", field.name, field.value) }))
                .collect();
            blocks.push(json!({ "type": "section", "fields": fields }));
        }
        if !message.buttons.is_empty() {
            let elements: Vec<Value> = message
                .buttons
                .iter()
                .map(|button| {
                    json!({
                        "type": "button",
                        "text": { "type": "plain_text", "text": button.label },
                        "url": button.url
                    })
                })
                .collect();
            blocks.push(json!({ "type": "actions", "elements": elements }));
        }
        self.post_message(
            external_user_id,
            json!({ "text": message.to_plain_text(), "blocks": blocks }),
        )
        .await
    }
}

pub fn verify_request(secret: &str, timestamp: &str, body: &[u8], signature: &str, now: i64) -> bool {
    let Ok(ts) = timestamp.trim().parse::<i64>() else {
        return false;
    };
    if now.abs_diff(ts) > MAX_CLOCK_SKEW_S {
        return false;
    }
    let Some(expected) = signature.trim().strip_prefix("v0=") else {
        return false;
    };
    let Ok(expected) = hex::decode(expected) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(format!("v0:{}:", timestamp.trim()).as_bytes());
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub fn extract_event(payload: &Value) -> Result<Option<ParsedMessage>> {
    if payload.get("type").and_then(Value::as_str) != Some("event_callback") {
        return Ok(None);
    }
    let event = payload
        .get("event")
        .ok_or_else(|| anyhow!("invalid slack payload: missing event"))?;
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
    if event_type != "message" && event_type != "app_mention" {
        return Ok(None);
    }
    // 机器人自身消息、编辑、入群等事件带有 bot_id 或 subtype，直接忽略。
    if event.get("bot_id").is_some() || event.get("subtype").is_some() {
        return Ok(None);
    }
    let user_id = event
        .get("user")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("invalid slack payload: missing user"))?;
    let text = event.get("text").and_then(Value::as_str).unwrap_or("");
    let text = strip_leading_mention(text).trim().to_string();
    if text.is_empty() {
        return Ok(None);
    }
    let message_id = payload
        .get("event_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| event.get("client_msg_id").and_then(Value::as_str).map(str::to_string));

    Ok(Some(ParsedMessage {
        external_user_id: user_id.to_string(),
        external_user_name: None,
        text,
        message_type: if event_type == "app_mention" {
            "mention".to_string()
        } else {
            "text".to_string()
        },
        message_id,
        raw_payload: payload.to_string(),
    }))
}

fn strip_leading_mention(text: &str) -> &str {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix("<@") {
        if let Some(end) = rest.find('>') {
            return &rest[end + 1..];
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};
    use std::collections::HashMap;

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";

    fn sign(timestamp: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("v0:{timestamp}:").as_bytes());
        mac.update(body);
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    async fn adapter() -> SlackAdapter {
        let mut adapter = SlackAdapter::new(Client::new());
        adapter
            .init(&AdapterConfig::Slack(SlackConfig {
                bot_token: Some("xoxb-1".to_string()),
                signing_secret: Some(SECRET.to_string()),
                api_base: None,
            }))
            .await
            .unwrap();
        adapter
    }

    #[test]
    fn verify_request_checks_window_and_mac() {
        let body = b"token=x&team_id=T1";
        let signature = sign("1710000000", body);
        assert!(verify_request(SECRET, "1710000000", body, &signature, 1710000100));
        assert!(!verify_request(SECRET, "1710000000", body, &signature, 1710000400));
        assert!(!verify_request(SECRET, "1710000000", b"tampered", &signature, 1710000100));
        assert!(!verify_request(SECRET, "1710000000", body, "v1=00", 1710000100));
    }

    #[test]
    fn extreme_timestamps_are_rejected() {
        let body = b"{}";
        for timestamp in [i64::MIN.to_string(), i64::MAX.to_string()] {
            assert!(!verify_request(SECRET, &timestamp, body, "v0=00", 1_710_000_000));
            assert!(!verify_request(SECRET, "1710000000", body, "v0=00", i64::MIN));
        }
    }

    #[tokio::test]
    async fn url_verification_echoes_challenge() {
        let adapter = adapter().await;
        let body = br#"{"type":"url_verification","challenge":"3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P"}"#;
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-slack-signature",
            HeaderValue::from_str(&sign(&timestamp, body)).unwrap(),
        );
        headers.insert(
            "x-slack-request-timestamp",
            HeaderValue::from_str(&timestamp).unwrap(),
        );
        let query = HashMap::new();
        let request = WebhookRequest::new(body, &headers, &query);
        assert_eq!(
            adapter.handle_challenge(&request).as_deref(),
            Some("3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P")
        );
    }

    #[test]
    fn app_mention_strips_bot_mention() {
        let payload = json!({
            "type": "event_callback",
            "event_id": "Ev01",
            "event": { "type": "app_mention", "user": "U1", "text": "<@UBOT> show orders" }
        });
        let parsed = extract_event(&payload).unwrap().unwrap();
        assert_eq!(parsed.text, "show orders");
        assert_eq!(parsed.message_id.as_deref(), Some("Ev01"));
        assert_eq!(parsed.message_type, "mention");
    }

    #[test]
    fn bot_and_subtype_messages_are_skipped() {
        let bot = json!({
            "type": "event_callback",
            "event_id": "Ev02",
            "event": { "type": "message", "bot_id": "B1", "text": "echo" }
        });
        assert!(extract_event(&bot).unwrap().is_none());
        let edited = json!({
            "type": "event_callback",
            "event_id": "Ev03",
            "event": { "type": "message", "subtype": "message_changed", "user": "U1" }
        });
        assert!(extract_event(&edited).unwrap().is_none());
    }
}
