use crate::bots::adapter::BotAdapter;
use crate::bots::types::{
    non_empty, resolve_api_base, AdapterConfig, DiscordConfig, ParsedMessage, Platform,
    RichMessage, WebhookRequest,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use reqwest::Client;
use serde_json::{json, Value};

const DEFAULT_API_BASE: &str = "discord.com/api/v10";
const MAX_CONTENT_CHARS: usize = 2000;
const INTERACTION_PING: i64 = 1;
const INTERACTION_APPLICATION_COMMAND: i64 = 2;
const EPHEMERAL_FLAG: i64 = 64;

pub struct DiscordAdapter {
    http: Client,
    config: DiscordConfig,
    public_key: Option<VerifyingKey>,
}

impl DiscordAdapter {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            config: DiscordConfig::default(),
            public_key: None,
        }
    }

    fn api_base(&self) -> String {
        resolve_api_base(self.config.api_base.as_ref(), DEFAULT_API_BASE)
    }

    fn bot_token(&self) -> Result<&str> {
        non_empty(self.config.bot_token.as_ref()).ok_or_else(|| anyhow!("discord bot_token missing"))
    }

    async fn open_dm_channel(&self, user_id: &str) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/users/@me/channels", self.api_base()))
            .header("Authorization", format!("Bot {}", self.bot_token()?))
            .json(&json!({ "recipient_id": user_id }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("discord dm channel failed: {status} {body}"));
        }
        let body: Value = response.json().await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("discord dm channel missing id"))
    }

    async fn post_message(&self, external_user_id: &str, payload: Value) -> Result<()> {
        let user_id = external_user_id.trim();
        if user_id.is_empty() {
            return Err(anyhow!("discord outbound user id missing"));
        }
        let channel_id = self.open_dm_channel(user_id).await?;
        let response = self
            .http
            .post(format!("{}/channels/{channel_id}/messages", self.api_base()))
            .header("Authorization", format!("Bot {}", self.bot_token()?))
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("discord outbound failed: {status} {body}"));
        }
        Ok(())
    }
}

#[async_trait]
impl BotAdapter for DiscordAdapter {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    async fn init(&mut self, config: &AdapterConfig) -> Result<()> {
        let AdapterConfig::Discord(config) = config else {
            return Err(anyhow!(
                "discord adapter cannot use {} config",
                config.platform()
            ));
        };
        let public_key = non_empty(config.public_key.as_ref())
            .ok_or_else(|| anyhow!("discord public_key missing"))?;
        self.public_key = Some(parse_public_key(public_key)?);
        self.config = config.clone();
        Ok(())
    }

    fn verify_signature(&self, request: &WebhookRequest<'_>) -> bool {
        let Some(public_key) = self.public_key.as_ref() else {
            return false;
        };
        let (Some(signature), Some(timestamp)) = (
            request.header("x-signature-ed25519"),
            request.header("x-signature-timestamp"),
        ) else {
            return false;
        };
        verify_interaction(public_key, signature, timestamp, request.body)
    }

    /// Discord 用带签名的 PING 探测端点，需返回 `{"type":1}`。
    fn handle_challenge(&self, request: &WebhookRequest<'_>) -> Option<String> {
        let payload = request.json()?;
        if payload.get("type").and_then(Value::as_i64) != Some(INTERACTION_PING) {
            return None;
        }
        if !self.verify_signature(request) {
            return None;
        }
        Some(json!({ "type": INTERACTION_PING }).to_string())
    }

    fn parse_message(&self, request: &WebhookRequest<'_>) -> Result<Option<ParsedMessage>> {
        let payload = request
            .json()
            .ok_or_else(|| anyhow!("invalid discord payload: body is not json"))?;
        if payload.get("t").and_then(Value::as_str) == Some("MESSAGE_CREATE") {
            return parse_message_create(&payload);
        }
        match payload.get("type").and_then(Value::as_i64) {
            Some(INTERACTION_APPLICATION_COMMAND) => parse_application_command(&payload),
            _ => Ok(None),
        }
    }

    fn ack_body(&self, message: &ParsedMessage) -> Option<String> {
        if message.message_type != "command" {
            return None;
        }
        Some(
            json!({
                "type": 4,
                "data": { "content": "Working on it...", "flags": EPHEMERAL_FLAG }
            })
            .to_string(),
        )
    }

    async fn send_reply(&self, external_user_id: &str, text: &str) -> Result<()> {
        self.post_message(
            external_user_id,
            json!({ "content": truncate_content(text) }),
        )
        .await
    }

    async fn send_rich_message(&self, external_user_id: &str, message: &RichMessage) -> Result<()> {
        let fields: Vec<Value> = message
            .fields
            .iter()
            .map(|field| json!({ "name": field.name, "value": field.value, "inline": false }))
            .collect();
        let mut embed = json!({ "description": truncate_content(&message.text), "fields": fields });
        if let Some(title) = message.title.as_deref().filter(|value| !value.trim().is_empty()) {
            embed["title"] = Value::String(title.trim().to_string());
        }
        let mut payload = json!({ "embeds": [embed] });
        if !message.buttons.is_empty() {
            let buttons: Vec<Value> = message
                .buttons
                .iter()
                .take(5)
                .map(|button| json!({ "type": 2, "style": 5, "label": button.label, "url": button.url }))
                .collect();
            payload["components"] = json!([{ "type": 1, "components": buttons }]);
        }
        self.post_message(external_user_id, payload).await
    }
}

pub fn parse_public_key(raw: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(raw.trim()).map_err(|_| anyhow!("discord public_key is not hex"))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("discord public_key length invalid"))?;
    VerifyingKey::from_bytes(&bytes).map_err(|err| anyhow!("discord public_key invalid: {err}"))
}

pub fn verify_interaction(
    public_key: &VerifyingKey,
    signature: &str,
    timestamp: &str,
    body: &[u8],
) -> bool {
    let Ok(signature) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(signature) = <[u8; 64]>::try_from(signature.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&signature);
    let mut message = Vec::with_capacity(timestamp.len() + body.len());
    message.extend_from_slice(timestamp.trim().as_bytes());
    message.extend_from_slice(body);
    public_key.verify(&message, &signature).is_ok()
}

fn parse_application_command(payload: &Value) -> Result<Option<ParsedMessage>> {
    let user = payload
        .get("member")
        .and_then(|member| member.get("user"))
        .or_else(|| payload.get("user"))
        .ok_or_else(|| anyhow!("invalid discord payload: missing user"))?;
    let user_id = string_field(user, "id")
        .ok_or_else(|| anyhow!("invalid discord payload: missing user id"))?;
    let data = payload
        .get("data")
        .ok_or_else(|| anyhow!("invalid discord payload: missing data"))?;
    let name = string_field(data, "name")
        .ok_or_else(|| anyhow!("invalid discord payload: missing command name"))?;

    let mut text = format!("/{name}");
    if let Some(options) = data.get("options").and_then(Value::as_array) {
        for option in options {
            let Some(option_name) = string_field(option, "name") else {
                continue;
            };
            let value = match option.get("value") {
                Some(Value::String(value)) => value.clone(),
                Some(Value::Null) | None => continue,
                Some(other) => other.to_string(),
            };
            text.push_str(&format!(" {option_name}={value}"));
        }
    }

    Ok(Some(ParsedMessage {
        external_user_id: user_id,
        external_user_name: string_field(user, "global_name")
            .or_else(|| string_field(user, "username")),
        text,
        message_type: "command".to_string(),
        message_id: string_field(payload, "id"),
        raw_payload: payload.to_string(),
    }))
}

fn parse_message_create(payload: &Value) -> Result<Option<ParsedMessage>> {
    let data = payload
        .get("d")
        .ok_or_else(|| anyhow!("invalid discord payload: missing d"))?;
    let author = data
        .get("author")
        .ok_or_else(|| anyhow!("invalid discord payload: missing author"))?;
    if author.get("bot").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(None);
    }
    let Some(content) = string_field(data, "content") else {
        return Ok(None);
    };
    let user_id = string_field(author, "id")
        .ok_or_else(|| anyhow!("invalid discord payload: missing author id"))?;
    Ok(Some(ParsedMessage {
        external_user_id: user_id,
        external_user_name: string_field(author, "global_name")
            .or_else(|| string_field(author, "username")),
        text: content,
        message_type: "text".to_string(),
        message_id: string_field(data, "id"),
        raw_payload: payload.to_string(),
    }))
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn truncate_content(text: &str) -> String {
    if text.chars().count() <= MAX_CONTENT_CHARS {
        return text.to_string();
    }
    let mut output: String = text.chars().take(MAX_CONTENT_CHARS - 3).collect();
    output.push_str("...");
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};
    use ed25519_dalek::{Signer, SigningKey};
    use std::collections::HashMap;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[9u8; 32])
    }

    async fn adapter() -> DiscordAdapter {
        let mut adapter = DiscordAdapter::new(Client::new());
        adapter
            .init(&AdapterConfig::Discord(DiscordConfig {
                application_id: Some("app".to_string()),
                public_key: Some(hex::encode(signing_key().verifying_key().to_bytes())),
                bot_token: Some("bot-token".to_string()),
                api_base: None,
            }))
            .await
            .unwrap();
        adapter
    }

    fn signed_headers(body: &[u8], timestamp: &str) -> HeaderMap {
        let mut message = timestamp.as_bytes().to_vec();
        message.extend_from_slice(body);
        let signature = signing_key().sign(&message);
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-signature-ed25519",
            HeaderValue::from_str(&hex::encode(signature.to_bytes())).unwrap(),
        );
        headers.insert(
            "x-signature-timestamp",
            HeaderValue::from_str(timestamp).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn signed_ping_is_answered() {
        let adapter = adapter().await;
        let body = br#"{"type":1}"#;
        let headers = signed_headers(body, "1710000000");
        let query = HashMap::new();
        let request = WebhookRequest::new(body, &headers, &query);
        assert_eq!(adapter.handle_challenge(&request).as_deref(), Some(r#"{"type":1}"#));
    }

    #[tokio::test]
    async fn tampered_body_fails_verification() {
        let adapter = adapter().await;
        let headers = signed_headers(br#"{"type":1}"#, "1710000000");
        let query = HashMap::new();
        let request = WebhookRequest::new(br#"{"type":2}"#, &headers, &query);
        assert!(!adapter.verify_signature(&request));
        assert!(adapter.handle_challenge(&request).is_none());
    }

    #[tokio::test]
    async fn application_command_becomes_slash_text() {
        let adapter = adapter().await;
        let body = serde_json::to_vec(&json!({
            "id": "998877",
            "type": 2,
            "member": { "user": { "id": "42", "username": "alice" } },
            "data": { "name": "orders", "options": [
                { "name": "status", "value": "open" },
                { "name": "limit", "value": 5 }
            ] }
        }))
        .unwrap();
        let headers = signed_headers(&body, "1710000000");
        let query = HashMap::new();
        let request = WebhookRequest::new(&body, &headers, &query);
        assert!(adapter.verify_signature(&request));
        let parsed = adapter.parse_message(&request).unwrap().unwrap();
        assert_eq!(parsed.external_user_id, "42");
        assert_eq!(parsed.text, "/orders status=open limit=5");
        assert_eq!(parsed.message_id.as_deref(), Some("998877"));
        let ack: Value = serde_json::from_str(&adapter.ack_body(&parsed).unwrap()).unwrap();
        assert_eq!(ack["type"], 4);
    }

    #[tokio::test]
    async fn bot_authored_messages_are_ignored() {
        let adapter = adapter().await;
        let body = serde_json::to_vec(&json!({
            "t": "MESSAGE_CREATE",
            "d": { "id": "1", "content": "hi", "author": { "id": "7", "bot": true } }
        }))
        .unwrap();
        let headers = HeaderMap::new();
        let query = HashMap::new();
        let request = WebhookRequest::new(&body, &headers, &query);
        assert!(adapter.parse_message(&request).unwrap().is_none());
    }

    #[test]
    fn truncate_content_respects_limit() {
        let long = "a".repeat(MAX_CONTENT_CHARS + 10);
        assert_eq!(truncate_content(&long).chars().count(), MAX_CONTENT_CHARS);
    }
}
