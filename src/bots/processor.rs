use crate::bots::adapter::BotAdapter;
use crate::bots::conversation::ConversationLinker;
use crate::bots::errors::BotError;
use crate::bots::registry::AdapterRegistry;
use crate::bots::responder::Responder;
use crate::bots::retry::{now_ts, BackoffPolicy};
use crate::storage::{
    ActionResult, BotEventFailure, BotEventProgress, BotEventRecord, BotRecord,
    ConversationRecord, MessagePair, MessageRole, StorageBackend,
};
use anyhow::{anyhow, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const USER_FACING_FAILURE: &str = "your request could not be completed, please try again later";

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// 事件已被其他 worker 占用，或已处于终态。
    NotClaimed,
    Completed,
    RetryScheduled { retry_count: i64, next_retry_at: f64 },
    Exhausted { retry_count: i64 },
    /// 占用已原样归还。
    Released,
}

/// 驱动单个事件从抢占走到终态或等待重试。
///
/// 每次尝试都会保存进度（会话、用户消息、动作结果、助手消息），
/// 重试时从最后完成的步骤继续，
/// 不会重复追加消息或重新执行应答器。
pub struct EventProcessor {
    storage: Arc<dyn StorageBackend>,
    registry: AdapterRegistry,
    linker: ConversationLinker,
    responder: Arc<dyn Responder>,
    backoff: BackoffPolicy,
}

impl EventProcessor {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        registry: AdapterRegistry,
        linker: ConversationLinker,
        responder: Arc<dyn Responder>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            storage,
            registry,
            linker,
            responder,
            backoff,
        }
    }

    pub async fn process_event(&self, event_id: i64) -> Result<ProcessOutcome, BotError> {
        let storage = self.storage.clone();
        let loaded = tokio::task::spawn_blocking(move || -> Result<_> {
            let Some(event) = storage.get_bot_event(event_id)? else {
                return Ok(None);
            };
            let bot = storage.get_bot(event.bot_id)?;
            Ok(Some((event, bot)))
        })
        .await
        .unwrap_or_else(|err| Err(anyhow!(err)))?;
        match loaded {
            None => {
                warn!(event_id, "event not found, skipping");
                Ok(ProcessOutcome::NotClaimed)
            }
            Some((event, None)) => {
                warn!(event_id, bot_id = event.bot_id, "bot missing for event, skipping");
                Ok(ProcessOutcome::NotClaimed)
            }
            Some((event, Some(bot))) => self.process(&bot, &event).await,
        }
    }

    pub async fn process(
        &self,
        bot: &BotRecord,
        event: &BotEventRecord,
    ) -> Result<ProcessOutcome, BotError> {
        let started = Instant::now();
        let storage = self.storage.clone();
        let event_id = event.id;
        let claimed =
            tokio::task::spawn_blocking(move || storage.claim_bot_event(event_id, now_ts()))
                .await
                .unwrap_or_else(|err| Err(anyhow!(err)))?;
        let Some(prior) = claimed else {
            debug!(bot_id = bot.id, event_id, "event not claimable");
            return Ok(ProcessOutcome::NotClaimed);
        };

        // 配置可能在入库后被改坏，初始化失败按处理失败计入重试次数。
        let adapter = match self
            .registry
            .create(bot.platform, Some(&bot.adapter_config))
            .await
        {
            Ok(adapter) => adapter,
            Err(err) => {
                return self
                    .record_failure(bot, None, &prior, started, anyhow!(err))
                    .await;
            }
        };

        let conversation = match self
            .linker
            .get_or_create(bot.id, &prior.external_user_id)
            .await
        {
            Ok(conversation) => conversation,
            Err(err) => {
                warn!(bot_id = bot.id, event_id, "conversation lookup failed, releasing claim: {err}");
                let storage = self.storage.clone();
                let snapshot = prior.clone();
                tokio::task::spawn_blocking(move || {
                    storage.release_bot_event_claim(snapshot.id, &snapshot)
                })
                .await
                .unwrap_or_else(|err| Err(anyhow!(err)))?;
                return Ok(ProcessOutcome::Released);
            }
        };

        match self
            .run_attempt(bot, adapter.as_ref(), &prior, &conversation)
            .await
        {
            Ok((result, pair)) => {
                let elapsed = started.elapsed().as_millis() as i64;
                let storage = self.storage.clone();
                let completed = tokio::task::spawn_blocking(move || {
                    storage.complete_bot_event(event_id, &result, pair, elapsed)
                })
                .await
                .unwrap_or_else(|err| Err(anyhow!(err)))?;
                if !completed {
                    warn!(bot_id = bot.id, event_id, "event left processing before completion");
                    return Ok(ProcessOutcome::NotClaimed);
                }
                info!(
                    bot_id = bot.id,
                    event_id,
                    processing_time_ms = elapsed,
                    "event completed"
                );
                Ok(ProcessOutcome::Completed)
            }
            Err(err) => {
                self.record_failure(bot, Some(adapter.as_ref()), &prior, started, err)
                    .await
            }
        }
    }

    async fn run_attempt(
        &self,
        bot: &BotRecord,
        adapter: &dyn BotAdapter,
        prior: &BotEventRecord,
        conversation: &ConversationRecord,
    ) -> Result<(ActionResult, MessagePair)> {
        let mut progress = BotEventProgress {
            conversation_id: Some(conversation.id),
            user_message_id: prior.user_message_id,
            assistant_message_id: prior.assistant_message_id,
            action_result: prior.action_result.clone(),
        };
        if prior.conversation_id.is_some() && prior.conversation_id != Some(conversation.id) {
            progress.user_message_id = None;
            progress.assistant_message_id = None;
        }

        let user_message_id = match progress.user_message_id {
            Some(id) => id,
            None => {
                let message = self
                    .linker
                    .append(conversation.id, MessageRole::User, &prior.content)
                    .await?;
                progress.user_message_id = Some(message.id);
                self.save_progress(prior.id, &progress).await?;
                message.id
            }
        };

        let result = match progress.action_result.clone() {
            Some(result) => result,
            None => {
                let result = self
                    .with_timeout(bot, "responder", self.responder.respond(bot, prior, conversation))
                    .await?;
                progress.action_result = Some(result.clone());
                self.save_progress(prior.id, &progress).await?;
                result
            }
        };

        let assistant_message_id = match progress.assistant_message_id {
            Some(id) => id,
            None => {
                let message = self
                    .linker
                    .append(
                        conversation.id,
                        MessageRole::Assistant,
                        &result.to_plain_text(),
                    )
                    .await?;
                progress.assistant_message_id = Some(message.id);
                self.save_progress(prior.id, &progress).await?;
                message.id
            }
        };

        match &result {
            ActionResult::Text { text } => {
                self.with_timeout(
                    bot,
                    "send_reply",
                    adapter.send_reply(&prior.external_user_id, text),
                )
                .await?
            }
            ActionResult::Rich { message } => {
                self.with_timeout(
                    bot,
                    "send_rich_message",
                    adapter.send_rich_message(&prior.external_user_id, message),
                )
                .await?
            }
        }

        Ok((
            result,
            MessagePair {
                user_message_id,
                assistant_message_id,
            },
        ))
    }

    async fn record_failure(
        &self,
        bot: &BotRecord,
        adapter: Option<&dyn BotAdapter>,
        prior: &BotEventRecord,
        started: Instant,
        err: anyhow::Error,
    ) -> Result<ProcessOutcome, BotError> {
        let max_retries = prior.max_retries.max(0);
        let retry_count = (prior.retry_count + 1).min(max_retries);
        let terminal = retry_count >= max_retries;
        let next_retry_at = (!terminal).then(|| {
            self.backoff
                .compute_retry_at(now_ts(), bot.request_timeout_ms, retry_count)
        });
        let failure = BotEventFailure {
            retry_count,
            next_retry_at,
            error_message: err.to_string(),
            processing_time_ms: started.elapsed().as_millis() as i64,
        };
        let storage = self.storage.clone();
        let event_id = prior.id;
        let recorded = tokio::task::spawn_blocking(move || storage.fail_bot_event(event_id, &failure))
            .await
            .unwrap_or_else(|err| Err(anyhow!(err)))?;
        if !recorded {
            warn!(bot_id = bot.id, event_id, "event left processing before failure was recorded");
            return Ok(ProcessOutcome::NotClaimed);
        }

        match next_retry_at {
            Some(next_retry_at) => {
                let error = BotError::Processing(err.to_string());
                warn!(
                    bot_id = bot.id,
                    event_id,
                    retry_count,
                    next_retry_at,
                    code = error.code(),
                    "{error}"
                );
                Ok(ProcessOutcome::RetryScheduled {
                    retry_count,
                    next_retry_at,
                })
            }
            None => {
                let error = BotError::Terminal {
                    retries: retry_count,
                    message: err.to_string(),
                };
                error!(bot_id = bot.id, event_id, code = error.code(), "{error}");
                let Some(adapter) = adapter else {
                    warn!(bot_id = bot.id, event_id, "no adapter available to notify user");
                    return Ok(ProcessOutcome::Exhausted { retry_count });
                };
                let notice = self
                    .with_timeout(
                        bot,
                        "send_error",
                        adapter.send_error(&prior.external_user_id, USER_FACING_FAILURE),
                    )
                    .await;
                if let Err(notice_err) = notice {
                    warn!(bot_id = bot.id, event_id, "failed to notify user: {notice_err}");
                }
                Ok(ProcessOutcome::Exhausted { retry_count })
            }
        }
    }

    async fn save_progress(&self, event_id: i64, progress: &BotEventProgress) -> Result<()> {
        let storage = self.storage.clone();
        let progress = progress.clone();
        let saved =
            tokio::task::spawn_blocking(move || storage.save_bot_event_progress(event_id, &progress))
                .await
                .unwrap_or_else(|err| Err(anyhow!(err)))?;
        if !saved {
            return Err(anyhow!("event {event_id} is no longer processing"));
        }
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        bot: &BotRecord,
        step: &str,
        future: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = Duration::from_millis(bot.request_timeout_ms.max(1) as u64);
        match timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("{step} timed out after {}ms", limit.as_millis())),
        }
    }
}
