// 全局状态：存储、适配器注册表、事件处理器与重试调度器。
use crate::bots::{
    build_default_adapter_registry, AdapterRegistry, BackoffPolicy, BotRateLimiter,
    ConversationLinker, DefaultResponder, EventProcessor, HttpActionExecutor, Responder,
    RetryScheduler, WebhookIngestor,
};
use crate::core::config::Config;
use crate::services::llm::{is_llm_configured, LlmClient};
use crate::storage::{build_storage, StorageBackend};
use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn StorageBackend>,
    pub registry: AdapterRegistry,
    pub processor: Arc<EventProcessor>,
    pub ingestor: Arc<WebhookIngestor>,
    pub scheduler: Arc<RetryScheduler>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let storage = build_storage(&config.storage)?;
        storage.ensure_initialized().context("存储初始化失败")?;
        seed_from_config(storage.as_ref(), &config)?;

        let http = Client::builder().build().context("HTTP 客户端初始化失败")?;
        let registry = build_default_adapter_registry(http.clone())?;
        let responder = build_responder(storage.clone(), http, &config);
        Ok(Self::with_parts(config, storage, registry, responder))
    }

    /// 组装处理管线，测试中可替换适配器与应答器。
    pub fn with_parts(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        registry: AdapterRegistry,
        responder: Arc<dyn Responder>,
    ) -> Self {
        let linker = ConversationLinker::new(storage.clone());
        let processor = Arc::new(EventProcessor::new(
            storage.clone(),
            registry.clone(),
            linker,
            responder,
            BackoffPolicy::new(&config.retry),
        ));
        let ingestor = Arc::new(WebhookIngestor::new(
            storage.clone(),
            registry.clone(),
            processor.clone(),
            BotRateLimiter::new(),
        ));
        let scheduler = Arc::new(RetryScheduler::new(
            storage.clone(),
            processor.clone(),
            config.retry.clone(),
        ));
        Self {
            config,
            storage,
            registry,
            processor,
            ingestor,
            scheduler,
        }
    }
}

fn build_responder(
    storage: Arc<dyn StorageBackend>,
    http: Client,
    config: &Config,
) -> Arc<dyn Responder> {
    let linker = ConversationLinker::new(storage.clone());
    let executor = Arc::new(HttpActionExecutor::new(http.clone()));
    let mut responder =
        DefaultResponder::new(storage, linker, executor, config.responder.clone());
    for (id, provider) in &config.llm.providers {
        if !is_llm_configured(provider) {
            warn!("LLM 提供方 {id} 未配置模型，已跳过");
            continue;
        }
        responder = responder.with_provider(
            id.clone(),
            Arc::new(LlmClient::new(http.clone(), provider.clone())),
        );
    }
    let default_provider = Some(config.llm.default.trim().to_string());
    Arc::new(responder.with_default_provider(default_provider))
}

/// 将配置中的动作与机器人写入存储，并记录创建或更新日志。
pub fn seed_from_config(storage: &dyn StorageBackend, config: &Config) -> Result<()> {
    for action in &config.actions {
        let record = action.to_record()?;
        storage.upsert_action(&record)?;
    }
    for bot in &config.bots {
        let record = bot.to_record()?;
        let created = storage.upsert_bot(&record)?;
        let action = if created { "create" } else { "update" };
        storage.append_bot_log(record.id, action, Some(record.platform.as_str()))?;
        for (external_user_id, internal_user_id) in &bot.user_bindings {
            let (external_user_id, internal_user_id) =
                (external_user_id.trim(), internal_user_id.trim());
            if external_user_id.is_empty() || internal_user_id.is_empty() {
                continue;
            }
            storage.upsert_bot_user_binding(record.id, external_user_id, internal_user_id)?;
        }
        info!(
            bot_id = record.id,
            platform = %record.platform,
            "机器人配置已{}",
            if created { "创建" } else { "更新" }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::parse_config_str;

    #[test]
    fn seeding_twice_logs_create_then_update() {
        let path = std::env::temp_dir().join(format!("bothook-seed-{}.db", uuid::Uuid::new_v4()));
        let config = parse_config_str(&format!(
            r#"
storage:
  db_path: "{}"
actions:
  - id: orders
    type: api
    payload:
      url: http://localhost/orders
bots:
  - id: 5
    platform: telegram
    webhook_token: tg-5
    adapter_config:
      bot_token: "123:abc"
    user_bindings:
      "1001": emp-7
"#,
            path.to_string_lossy()
        ))
        .unwrap();
        let storage = build_storage(&config.storage).unwrap();
        storage.ensure_initialized().unwrap();
        seed_from_config(storage.as_ref(), &config).unwrap();
        seed_from_config(storage.as_ref(), &config).unwrap();

        let logs = storage.list_bot_logs(5).unwrap();
        let actions: Vec<&str> = logs.iter().map(|log| log.action.as_str()).collect();
        assert_eq!(actions, vec!["create", "update"]);
        assert!(storage.get_bot_by_webhook_token("tg-5").unwrap().is_some());
        assert!(storage.get_action("orders").unwrap().is_some());
        assert_eq!(
            storage.get_bot_user_binding(5, "1001").unwrap().as_deref(),
            Some("emp-7")
        );
        assert_eq!(storage.get_bot_user_binding(5, "1002").unwrap(), None);
    }
}
