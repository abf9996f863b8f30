// 配置读取：YAML 文件 + 环境变量占位符展开 + 监听地址覆盖。
use crate::bots::types::{AdapterConfig, Platform};
use crate::storage::{ActionRecord, ActionType, BotRecord};
use anyhow::{anyhow, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::fs;
use tracing::warn;

pub const CONFIG_PATH_ENV: &str = "BOTHOOK_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/bothook.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub actions: Vec<ActionSeedConfig>,
    #[serde(default)]
    pub bots: Vec<BotSeedConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    #[serde(deserialize_with = "deserialize_u16_from_any")]
    pub port: u16,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: String,
    /// `json` 切换为结构化日志，其余值使用文本格式。
    #[serde(default)]
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: String,
    pub db_path: String,
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            db_path: "./data/bothook.db".to_string(),
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub worker_enabled: bool,
    pub poll_interval_ms: u64,
    pub max_batch: i64,
    pub max_delay_ms: u64,
    pub min_base_delay_ms: u64,
    pub jitter_ratio: f64,
    /// 固定随机种子后退避时间可复现。
    pub seed: Option<u64>,
    pub stale_pending_s: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            worker_enabled: true,
            poll_interval_ms: 2000,
            max_batch: 50,
            max_delay_ms: 10 * 60 * 1000,
            min_base_delay_ms: 1000,
            jitter_ratio: 0.2,
            seed: None,
            stale_pending_s: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    pub history_limit: i64,
    pub system_prompt: String,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            history_limit: 10,
            system_prompt: "You are a helpful assistant answering questions about the operator's data. \
                            Reply concisely."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub providers: HashMap<String, LlmProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output: Option<u32>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSeedConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", alias = "action_type")]
    pub action_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ActionSeedConfig {
    pub fn to_record(&self) -> Result<ActionRecord> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(anyhow!("action id is empty"));
        }
        let action_type = ActionType::parse(&self.action_type)
            .ok_or_else(|| anyhow!("action {id}: unknown type {}", self.action_type))?;
        let name = if self.name.trim().is_empty() {
            id.to_string()
        } else {
            self.name.trim().to_string()
        };
        Ok(ActionRecord {
            id: id.to_string(),
            name,
            action_type,
            payload: self.payload.clone(),
            created_at: 0.0,
            updated_at: 0.0,
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> i64 {
    3
}

fn default_request_timeout_ms() -> i64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSeedConfig {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "type")]
    pub platform: String,
    #[serde(alias = "webhookToken")]
    pub webhook_token: String,
    #[serde(default, alias = "adapterConfig")]
    pub adapter_config: serde_json::Value,
    #[serde(default, alias = "enabledActionIds")]
    pub enabled_action_ids: Vec<String>,
    #[serde(default, alias = "enabledDatasourceIds")]
    pub enabled_datasource_ids: Vec<String>,
    #[serde(default, alias = "aiProviderId")]
    pub ai_provider_id: Option<String>,
    #[serde(default, alias = "enableQuery")]
    pub enable_query: bool,
    #[serde(default = "default_true", alias = "isActive")]
    pub is_active: bool,
    #[serde(default, alias = "rateLimit")]
    pub rate_limit: i64,
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: i64,
    #[serde(default = "default_request_timeout_ms", alias = "requestTimeoutMs")]
    pub request_timeout_ms: i64,
    /// 平台用户 id 到内部用户 id 的映射。
    #[serde(default, alias = "userBindings")]
    pub user_bindings: BTreeMap<String, String>,
}

impl BotSeedConfig {
    pub fn to_record(&self) -> Result<BotRecord> {
        let platform = Platform::parse(&self.platform)
            .ok_or_else(|| anyhow!("bot {}: unknown platform {}", self.id, self.platform))?;
        let webhook_token = self.webhook_token.trim();
        if webhook_token.is_empty() {
            return Err(anyhow!("bot {}: webhook_token is empty", self.id));
        }
        let adapter_config = AdapterConfig::from_settings(platform, &self.adapter_config)
            .map_err(|err| anyhow!("bot {}: invalid adapter_config: {err}", self.id))?;
        let name = if self.name.trim().is_empty() {
            format!("{platform}-{}", self.id)
        } else {
            self.name.trim().to_string()
        };
        Ok(BotRecord {
            id: self.id,
            name,
            platform,
            webhook_token: webhook_token.to_string(),
            adapter_config,
            enabled_action_ids: self.enabled_action_ids.clone(),
            enabled_datasource_ids: self.enabled_datasource_ids.clone(),
            ai_provider_id: self
                .ai_provider_id
                .as_ref()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            enable_query: self.enable_query,
            is_active: self.is_active,
            rate_limit: self.rate_limit.max(0),
            max_retries: self.max_retries.max(0),
            request_timeout_ms: self.request_timeout_ms.max(1),
            created_at: 0.0,
            updated_at: 0.0,
        })
    }
}

fn deserialize_u16_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct U16Visitor;

    impl<'de> Visitor<'de> for U16Visitor {
        type Value = u16;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("u16 or numeric string")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u16::try_from(value).map_err(|_| E::custom("u16 out of range"))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value < 0 {
                return Err(E::custom("u16 must be non-negative"));
            }
            self.visit_u64(value as u64)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            value
                .trim()
                .parse::<u16>()
                .map_err(|_| E::custom("invalid u16 string"))
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&value)
        }
    }

    deserializer.deserialize_any(U16Visitor)
}

pub fn load_config() -> Config {
    let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = load_config_from(&path);
    // 环境变量优先于配置文件中的监听地址。
    if let Some(host) = env::var("BOTHOOK_HOST")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        config.server.host = host;
    }
    if let Some(port) = env::var("BOTHOOK_PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        config.server.port = port;
    }
    config
}

pub fn load_config_from(path: &str) -> Config {
    let mut value = read_yaml(path);
    expand_yaml_env(&mut value);
    parse_config(value)
}

pub fn parse_config_str(content: &str) -> Result<Config> {
    let mut value: Value = serde_yaml::from_str(content)?;
    expand_yaml_env(&mut value);
    if value.is_null() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_value::<Config>(value)?)
}

fn parse_config(value: Value) -> Config {
    if value.is_null() {
        return Config::default();
    }
    serde_yaml::from_value::<Config>(value).unwrap_or_else(|err| {
        warn!("配置解析失败，使用默认配置: {err}");
        Config::default()
    })
}

fn read_yaml(path: &str) -> Value {
    // 配置文件允许不存在，首次启动时使用默认配置。
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("读取配置失败: {path}, {err}");
            return Value::Null;
        }
    };
    serde_yaml::from_str(&content).unwrap_or_else(|err| {
        warn!("解析 YAML 失败: {path}, {err}");
        Value::Null
    })
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => {
            *text = expand_env_placeholders(text);
        }
        Value::Sequence(items) => {
            for item in items {
                expand_yaml_env(item);
            }
        }
        Value::Mapping(map) => {
            for (_, value) in map.iter_mut() {
                expand_yaml_env(value);
            }
        }
        _ => {}
    }
}

fn expand_env_placeholders(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            output.push_str("${");
            output.push_str(rest);
            return output;
        };
        let inner = &rest[..end];
        rest = &rest[end + 1..];
        let (name, default_value) = match inner.split_once(":-") {
            Some((name, default_value)) => (name.trim(), Some(default_value)),
            None => (inner.trim(), None),
        };
        if name.is_empty() {
            output.push_str("${");
            output.push_str(inner);
            output.push('}');
            continue;
        }
        let resolved = env::var(name).ok().filter(|value| !value.is_empty());
        match (resolved, default_value) {
            (Some(value), _) => output.push_str(&value),
            (None, Some(default_value)) => output.push_str(default_value),
            (None, None) => {}
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_placeholders() {
        std::env::remove_var("BOTHOOK_TEST_PLACEHOLDER");
        assert_eq!(
            expand_env_placeholders("${BOTHOOK_TEST_PLACEHOLDER:-default}"),
            "default"
        );
        std::env::set_var("BOTHOOK_TEST_PLACEHOLDER", "value");
        assert_eq!(
            expand_env_placeholders("prefix-${BOTHOOK_TEST_PLACEHOLDER}-suffix"),
            "prefix-value-suffix"
        );
        std::env::remove_var("BOTHOOK_TEST_PLACEHOLDER");
        assert_eq!(expand_env_placeholders("${BOTHOOK_TEST_PLACEHOLDER}"), "");
    }

    #[test]
    fn parse_config_reads_bots_and_defaults() {
        let config = parse_config_str(
            r#"
server:
  port: "${BOTHOOK_TEST_UNSET_PORT:-9100}"
retry:
  seed: 7
bots:
  - id: 5
    platform: telegram
    webhook_token: tg-hook
    adapter_config:
      botToken: "123:abc"
    max_retries: 2
actions:
  - id: orders
    type: api
    payload:
      url: http://localhost:9000/orders
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.retry.seed, Some(7));
        assert_eq!(config.retry.poll_interval_ms, 2000);
        let bot = config.bots[0].to_record().unwrap();
        assert_eq!(bot.platform, Platform::Telegram);
        assert_eq!(bot.max_retries, 2);
        assert!(bot.is_active);
        assert_eq!(bot.request_timeout_ms, 30_000);
        let action = config.actions[0].to_record().unwrap();
        assert_eq!(action.action_type, ActionType::Api);
    }

    #[test]
    fn bot_seed_rejects_unknown_platform() {
        let seed = BotSeedConfig {
            id: 1,
            name: String::new(),
            platform: "irc".to_string(),
            webhook_token: "t".to_string(),
            adapter_config: serde_json::Value::Null,
            enabled_action_ids: Vec::new(),
            enabled_datasource_ids: Vec::new(),
            ai_provider_id: None,
            enable_query: false,
            is_active: true,
            rate_limit: 0,
            max_retries: 3,
            request_timeout_ms: 1000,
            user_bindings: Default::default(),
        };
        assert!(seed.to_record().is_err());
    }

    #[test]
    fn bundled_sample_config_parses() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/bothook.yaml");
        let content = fs::read_to_string(path).unwrap();
        let config = parse_config_str(&content).unwrap();
        assert_eq!(config.bots.len(), 2);
        for bot in &config.bots {
            bot.to_record().unwrap();
        }
        for action in &config.actions {
            action.to_record().unwrap();
        }
    }
}
