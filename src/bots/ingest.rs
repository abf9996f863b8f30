use crate::bots::errors::BotError;
use crate::bots::processor::EventProcessor;
use crate::bots::rate_limit::BotRateLimiter;
use crate::bots::registry::AdapterRegistry;
use crate::bots::types::{ParsedMessage, WebhookRequest};
use crate::storage::{BotRecord, NewBotEvent, StorageBackend};
use anyhow::anyhow;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// 握手探测，响应体需原样回显。
    ChallengeEcho(String),
    Acknowledged {
        event_id: Option<i64>,
        duplicate: bool,
        /// 适配器提供的平台确认响应体。
        body: Option<String>,
    },
}

/// 把一次 Webhook 投递转换为至多一条持久事件。
///
/// 去重依赖 `(bot_id, external_event_id)` 唯一键，并发的重复投递
/// 也只会产生一行记录和一次派发。
pub struct WebhookIngestor {
    storage: Arc<dyn StorageBackend>,
    registry: AdapterRegistry,
    processor: Arc<EventProcessor>,
    limiter: BotRateLimiter,
}

impl WebhookIngestor {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        registry: AdapterRegistry,
        processor: Arc<EventProcessor>,
        limiter: BotRateLimiter,
    ) -> Self {
        Self {
            storage,
            registry,
            processor,
            limiter,
        }
    }

    pub async fn ingest(
        &self,
        webhook_token: &str,
        body: &[u8],
        headers: &HeaderMap,
        query: &HashMap<String, String>,
    ) -> Result<IngestOutcome, BotError> {
        let bot = self.resolve_bot(webhook_token).await?;
        let adapter = self
            .registry
            .create(bot.platform, Some(&bot.adapter_config))
            .await?;
        let request = WebhookRequest::new(body, headers, query);

        if let Some(echo) = adapter.handle_challenge(&request) {
            debug!(bot_id = bot.id, platform = %bot.platform, "answered webhook challenge");
            return Ok(IngestOutcome::ChallengeEcho(echo));
        }
        if !adapter.verify_signature(&request) {
            warn!(bot_id = bot.id, platform = %bot.platform, "webhook signature rejected");
            return Err(BotError::InvalidSignature);
        }
        let parsed = match adapter.parse_message(&request) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => {
                debug!(bot_id = bot.id, "delivery carries no user message");
                return Ok(IngestOutcome::Acknowledged {
                    event_id: None,
                    duplicate: false,
                    body: None,
                });
            }
            Err(err) => return Err(BotError::InvalidPayload(err.to_string())),
        };
        let external_event_id = parsed
            .message_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| fingerprint(&parsed.external_user_id, body));

        // 平台重投已入库的事件直接确认，不消耗限流令牌。
        if let Some(event_id) = self.find_event(bot.id, &external_event_id).await? {
            info!(bot_id = bot.id, event_id, "duplicate delivery acknowledged");
            return Ok(IngestOutcome::Acknowledged {
                event_id: Some(event_id),
                duplicate: true,
                body: adapter.ack_body(&parsed),
            });
        }
        if !self.limiter.try_acquire(bot.id, bot.rate_limit) {
            warn!(bot_id = bot.id, "webhook rate limited");
            return Err(BotError::RateLimited { bot_id: bot.id });
        }

        match self.record_event(&bot, &parsed, external_event_id).await {
            Ok(event_id) => {
                let processor = self.processor.clone();
                tokio::spawn(async move {
                    if let Err(err) = processor.process_event(event_id).await {
                        error!(event_id, code = err.code(), "event dispatch failed: {err}");
                    }
                });
                Ok(IngestOutcome::Acknowledged {
                    event_id: Some(event_id),
                    duplicate: false,
                    body: adapter.ack_body(&parsed),
                })
            }
            Err(BotError::DuplicateEvent { event_id }) => {
                info!(bot_id = bot.id, event_id, "duplicate delivery acknowledged");
                Ok(IngestOutcome::Acknowledged {
                    event_id: Some(event_id),
                    duplicate: true,
                    body: adapter.ack_body(&parsed),
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn resolve_bot(&self, webhook_token: &str) -> Result<BotRecord, BotError> {
        let token = webhook_token.trim().to_string();
        if token.is_empty() {
            return Err(BotError::UnknownBot { inactive: false });
        }
        let storage = self.storage.clone();
        let bot = tokio::task::spawn_blocking(move || storage.get_bot_by_webhook_token(&token))
            .await
            .unwrap_or_else(|err| Err(anyhow!(err)))?;
        match bot {
            None => Err(BotError::UnknownBot { inactive: false }),
            Some(bot) if !bot.is_active => Err(BotError::UnknownBot { inactive: true }),
            Some(bot) => Ok(bot),
        }
    }

    async fn find_event(
        &self,
        bot_id: i64,
        external_event_id: &str,
    ) -> Result<Option<i64>, BotError> {
        let storage = self.storage.clone();
        let external_event_id = external_event_id.to_string();
        let existing = tokio::task::spawn_blocking(move || {
            storage.get_bot_event_by_external_id(bot_id, &external_event_id)
        })
        .await
        .unwrap_or_else(|err| Err(anyhow!(err)))?;
        Ok(existing.map(|event| event.id))
    }

    /// 返回新事件 id；唯一键已存在时返回 `DuplicateEvent`。
    async fn record_event(
        &self,
        bot: &BotRecord,
        parsed: &ParsedMessage,
        external_event_id: String,
    ) -> Result<i64, BotError> {
        let storage = self.storage.clone();
        let bot_id = bot.id;
        let max_retries = bot.max_retries;
        let parsed = parsed.clone();
        let (record, inserted) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let internal_user_id =
                storage.get_bot_user_binding(bot_id, &parsed.external_user_id)?;
            storage.insert_bot_event_if_absent(&NewBotEvent {
                bot_id,
                external_event_id,
                content: parsed.text,
                external_user_id: parsed.external_user_id,
                external_user_name: parsed.external_user_name,
                internal_user_id,
                message_type: parsed.message_type,
                raw_payload: parsed.raw_payload,
                max_retries,
            })
        })
        .await
        .unwrap_or_else(|err| Err(anyhow!(err)))?;
        if !inserted {
            return Err(BotError::DuplicateEvent {
                event_id: record.id,
            });
        }
        info!(
            bot_id,
            event_id = record.id,
            external_event_id = %record.external_event_id,
            "event ingested"
        );
        Ok(record.id)
    }
}

/// 平台未提供消息 id 时的稳定指纹：`fp:` + SHA-256(用户 id, NUL, 原始 body) 的十六进制。
pub fn fingerprint(external_user_id: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(external_user_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(body);
    format!("fp:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_depends_on_user_and_body() {
        let base = fingerprint("u1", b"{\"text\":\"hi\"}");
        assert!(base.starts_with("fp:"));
        assert_eq!(base.len(), 3 + 64);
        assert_eq!(base, fingerprint("u1", b"{\"text\":\"hi\"}"));
        assert_ne!(base, fingerprint("u2", b"{\"text\":\"hi\"}"));
        assert_ne!(base, fingerprint("u1", b"{\"text\":\"hi!\"}"));
    }
}
