use crate::bots::adapter::BotAdapter;
use crate::bots::custom::CustomAdapter;
use crate::bots::discord::DiscordAdapter;
use crate::bots::errors::BotError;
use crate::bots::slack::SlackAdapter;
use crate::bots::telegram::TelegramAdapter;
use crate::bots::types::{AdapterConfig, Platform};
use crate::bots::wecom::WeComAdapter;
use parking_lot::RwLock;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;

pub type AdapterFactory = Arc<dyn Fn() -> Box<dyn BotAdapter> + Send + Sync>;

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: Arc<RwLock<HashMap<Platform, AdapterFactory>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, platform: Platform, factory: AdapterFactory) -> Result<(), BotError> {
        let mut guard = self.factories.write();
        if guard.contains_key(&platform) {
            return Err(BotError::DuplicateAdapter(platform));
        }
        guard.insert(platform, factory);
        Ok(())
    }

    pub fn get(&self, platform: Platform) -> Option<AdapterFactory> {
        self.factories.read().get(&platform).cloned()
    }

    pub async fn create(
        &self,
        platform: Platform,
        config: Option<&AdapterConfig>,
    ) -> Result<Arc<dyn BotAdapter>, BotError> {
        let factory = self
            .get(platform)
            .ok_or(BotError::UnregisteredAdapter(platform))?;
        let mut adapter = factory();
        if let Some(config) = config {
            adapter
                .init(config)
                .await
                .map_err(|err| BotError::InvalidAdapterConfig {
                    platform,
                    message: err.to_string(),
                })?;
        }
        Ok(Arc::from(adapter))
    }

    pub fn list(&self) -> Vec<Platform> {
        let mut items: Vec<Platform> = self.factories.read().keys().copied().collect();
        items.sort_unstable_by_key(|platform| platform.as_str());
        items
    }
}

pub fn build_default_adapter_registry(http: Client) -> Result<AdapterRegistry, BotError> {
    let registry = AdapterRegistry::new();
    let client = http.clone();
    registry.register(
        Platform::WeCom,
        Arc::new(move || Box::new(WeComAdapter::new(client.clone())) as Box<dyn BotAdapter>),
    )?;
    let client = http.clone();
    registry.register(
        Platform::Discord,
        Arc::new(move || Box::new(DiscordAdapter::new(client.clone())) as Box<dyn BotAdapter>),
    )?;
    let client = http.clone();
    registry.register(
        Platform::Telegram,
        Arc::new(move || Box::new(TelegramAdapter::new(client.clone())) as Box<dyn BotAdapter>),
    )?;
    let client = http.clone();
    registry.register(
        Platform::Slack,
        Arc::new(move || Box::new(SlackAdapter::new(client.clone())) as Box<dyn BotAdapter>),
    )?;
    let client = http;
    registry.register(
        Platform::Custom,
        Arc::new(move || Box::new(CustomAdapter::new(client.clone())) as Box<dyn BotAdapter>),
    )?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bots::types::{ParsedMessage, TelegramConfig, WebhookRequest};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    struct MockAdapter {
        initialized: bool,
    }

    #[async_trait]
    impl BotAdapter for MockAdapter {
        fn platform(&self) -> Platform {
            Platform::Custom
        }

        async fn init(&mut self, config: &AdapterConfig) -> Result<()> {
            if config.platform() != Platform::Custom {
                return Err(anyhow!("mock adapter expects custom config"));
            }
            self.initialized = true;
            Ok(())
        }

        fn verify_signature(&self, _request: &WebhookRequest<'_>) -> bool {
            self.initialized
        }

        fn parse_message(&self, _request: &WebhookRequest<'_>) -> Result<Option<ParsedMessage>> {
            Ok(None)
        }

        async fn send_reply(&self, _external_user_id: &str, _text: &str) -> Result<()> {
            Ok(())
        }
    }

    fn mock_factory() -> AdapterFactory {
        Arc::new(|| Box::new(MockAdapter { initialized: false }) as Box<dyn BotAdapter>)
    }

    #[test]
    fn register_and_get_factory() {
        let registry = AdapterRegistry::new();
        registry.register(Platform::Custom, mock_factory()).unwrap();
        assert!(registry.get(Platform::Custom).is_some());
        assert!(registry.get(Platform::Slack).is_none());
    }

    #[test]
    fn duplicate_register_returns_error() {
        let registry = AdapterRegistry::new();
        registry.register(Platform::Custom, mock_factory()).unwrap();
        let err = registry
            .register(Platform::Custom, mock_factory())
            .unwrap_err();
        assert!(matches!(err, BotError::DuplicateAdapter(Platform::Custom)));
    }

    #[tokio::test]
    async fn create_runs_init_when_config_supplied() {
        let registry = AdapterRegistry::new();
        registry.register(Platform::Custom, mock_factory()).unwrap();
        let config = AdapterConfig::Custom(Default::default());
        let adapter = registry
            .create(Platform::Custom, Some(&config))
            .await
            .unwrap();
        let headers = Default::default();
        let query = Default::default();
        assert!(adapter.verify_signature(&WebhookRequest::new(b"{}", &headers, &query)));

        let bare = registry.create(Platform::Custom, None).await.unwrap();
        assert!(!bare.verify_signature(&WebhookRequest::new(b"{}", &headers, &query)));
    }

    #[tokio::test]
    async fn create_unknown_platform_fails() {
        let registry = AdapterRegistry::new();
        let err = registry.create(Platform::Discord, None).await.err().unwrap();
        assert!(matches!(err, BotError::UnregisteredAdapter(Platform::Discord)));
    }

    #[tokio::test]
    async fn create_reports_init_failure_as_config_error() {
        let registry = AdapterRegistry::new();
        registry.register(Platform::Custom, mock_factory()).unwrap();
        let config = AdapterConfig::Telegram(TelegramConfig::default());
        let err = registry
            .create(Platform::Custom, Some(&config))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BotError::InvalidAdapterConfig { .. }));
    }

    #[test]
    fn default_registry_covers_every_platform() {
        let registry = build_default_adapter_registry(Client::new()).unwrap();
        assert_eq!(registry.list().len(), Platform::ALL.len());
    }
}
