use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[serde(alias = "wechat_work", alias = "wxwork")]
    WeCom,
    Discord,
    Telegram,
    Slack,
    Custom,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::WeCom,
        Platform::Discord,
        Platform::Telegram,
        Platform::Slack,
        Platform::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::WeCom => "wecom",
            Platform::Discord => "discord",
            Platform::Telegram => "telegram",
            Platform::Slack => "slack",
            Platform::Custom => "custom",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "wecom" | "wechat_work" | "wxwork" => Some(Platform::WeCom),
            "discord" => Some(Platform::Discord),
            "telegram" => Some(Platform::Telegram),
            "slack" => Some(Platform::Slack),
            "custom" => Some(Platform::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct WeComConfig {
    #[serde(default, alias = "corpId")]
    pub corp_id: Option<String>,
    #[serde(default, alias = "agentId")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, alias = "encodingAesKey")]
    pub encoding_aes_key: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DiscordConfig {
    #[serde(default, alias = "applicationId")]
    pub application_id: Option<String>,
    #[serde(default, alias = "publicKey")]
    pub public_key: Option<String>,
    #[serde(default, alias = "botToken")]
    pub bot_token: Option<String>,
    #[serde(default, alias = "apiBase")]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TelegramConfig {
    #[serde(default, alias = "botToken")]
    pub bot_token: Option<String>,
    #[serde(default, alias = "secretToken")]
    pub secret_token: Option<String>,
    #[serde(default, alias = "apiBase")]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SlackConfig {
    #[serde(default, alias = "botToken")]
    pub bot_token: Option<String>,
    #[serde(default, alias = "signingSecret")]
    pub signing_secret: Option<String>,
    #[serde(default, alias = "apiBase")]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CustomConfig {
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default, alias = "signatureHeader")]
    pub signature_header: Option<String>,
    #[serde(default, alias = "timestampHeader")]
    pub timestamp_header: Option<String>,
    #[serde(default, alias = "replyUrl")]
    pub reply_url: Option<String>,
    #[serde(default, alias = "replyToken")]
    pub reply_token: Option<String>,
}

/// 各平台适配器配置，以带标签的 JSON 存在机器人记录上。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "platform", content = "config", rename_all = "lowercase")]
pub enum AdapterConfig {
    WeCom(WeComConfig),
    Discord(DiscordConfig),
    Telegram(TelegramConfig),
    Slack(SlackConfig),
    Custom(CustomConfig),
}

impl AdapterConfig {
    pub fn platform(&self) -> Platform {
        match self {
            AdapterConfig::WeCom(_) => Platform::WeCom,
            AdapterConfig::Discord(_) => Platform::Discord,
            AdapterConfig::Telegram(_) => Platform::Telegram,
            AdapterConfig::Slack(_) => Platform::Slack,
            AdapterConfig::Custom(_) => Platform::Custom,
        }
    }

    /// 从不带标签的配置对象构建 `platform` 的配置，
    /// 即运维在 YAML 中书写的格式。
    pub fn from_settings(platform: Platform, settings: &Value) -> serde_json::Result<Self> {
        let settings = if settings.is_null() {
            Value::Object(Default::default())
        } else {
            settings.clone()
        };
        Ok(match platform {
            Platform::WeCom => AdapterConfig::WeCom(serde_json::from_value(settings)?),
            Platform::Discord => AdapterConfig::Discord(serde_json::from_value(settings)?),
            Platform::Telegram => AdapterConfig::Telegram(serde_json::from_value(settings)?),
            Platform::Slack => AdapterConfig::Slack(serde_json::from_value(settings)?),
            Platform::Custom => AdapterConfig::Custom(serde_json::from_value(settings)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub external_user_id: String,
    pub external_user_name: Option<String>,
    pub text: String,
    pub message_type: String,
    pub message_id: Option<String>,
    /// 序列化后的平台原始载荷，只由产生它的适配器解析。
    pub raw_payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RichField {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RichButton {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RichMessage {
    #[serde(default)]
    pub title: Option<String>,
    pub text: String,
    #[serde(default)]
    pub fields: Vec<RichField>,
    #[serde(default)]
    pub buttons: Vec<RichButton>,
}

impl RichMessage {
    /// 纯文本渲染，用于不支持结构化布局的平台或降级场景。
    pub fn to_plain_text(&self) -> String {
        let mut lines = Vec::new();
        if let Some(title) = self.title.as_deref().filter(|value| !value.trim().is_empty()) {
            lines.push(title.trim().to_string());
        }
        if !self.text.trim().is_empty() {
            lines.push(self.text.trim().to_string());
        }
        for field in &self.fields {
            lines.push(format!("{}: {}", field.name, field.value));
        }
        for button in &self.buttons {
            lines.push(format!("{} <{}>", button.label, button.url));
        }
        lines.join("\n")
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = Vec::new();
        if let Some(title) = self.title.as_deref().filter(|value| !value.trim().is_empty()) {
            lines.push(format!("**{}**", title.trim()));
        }
        if !self.text.trim().is_empty() {
            lines.push(self.text.trim().to_string());
        }
        for field in &self.fields {
            lines.push(format!("> {}: {}", field.name, field.value));
        }
        for button in &self.buttons {
            lines.push(format!("[{}]({})", button.label, button.url));
        }
        lines.join("\n")
    }
}

/// 适配器视角下的一次入站 Webhook 投递。
#[derive(Clone, Copy)]
pub struct WebhookRequest<'a> {
    pub body: &'a [u8],
    pub headers: &'a HeaderMap,
    pub query: &'a HashMap<String, String>,
}

impl<'a> WebhookRequest<'a> {
    pub fn new(
        body: &'a [u8],
        headers: &'a HeaderMap,
        query: &'a HashMap<String, String>,
    ) -> Self {
        Self {
            body,
            headers,
            query,
        }
    }

    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn query_param(&self, name: &str) -> Option<&'a str> {
        self.query
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn json(&self) -> Option<Value> {
        if self.body.iter().all(|byte| byte.is_ascii_whitespace()) {
            return None;
        }
        serde_json::from_slice::<Value>(self.body).ok()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(self.body).to_string()
    }
}

pub(crate) fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

pub(crate) fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|value| value.trim()).filter(|value| !value.is_empty())
}

pub(crate) fn resolve_api_base(configured: Option<&String>, default: &str) -> String {
    let base = non_empty(configured).unwrap_or(default);
    if base.starts_with("http://") || base.starts_with("https://") {
        base.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", base.trim_end_matches('/'))
    }
}
