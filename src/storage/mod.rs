// 存储模块：封装 SQLite 持久化读写，提供机器人/事件/会话的统一接口。

mod sqlite;

use crate::bots::types::{AdapterConfig, Platform, RichMessage};
use crate::core::config::StorageConfig;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub use sqlite::SqliteStorage;

#[derive(Debug, Clone, PartialEq)]
pub struct BotRecord {
    pub id: i64,
    pub name: String,
    pub platform: Platform,
    pub webhook_token: String,
    pub adapter_config: AdapterConfig,
    pub enabled_action_ids: Vec<String>,
    pub enabled_datasource_ids: Vec<String>,
    pub ai_provider_id: Option<String>,
    pub enable_query: bool,
    pub is_active: bool,
    /// 每分钟允许的消息数，0 表示不限制。
    pub rate_limit: i64,
    pub max_retries: i64,
    pub request_timeout_ms: i64,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotEventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BotEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotEventStatus::Pending => "pending",
            BotEventStatus::Processing => "processing",
            BotEventStatus::Completed => "completed",
            BotEventStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "pending" => Some(BotEventStatus::Pending),
            "processing" => Some(BotEventStatus::Processing),
            "completed" => Some(BotEventStatus::Completed),
            "failed" => Some(BotEventStatus::Failed),
            _ => None,
        }
    }
}

/// 处理结果：发送给平台的最终回复。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionResult {
    Text { text: String },
    Rich { message: RichMessage },
}

impl ActionResult {
    pub fn to_plain_text(&self) -> String {
        match self {
            ActionResult::Text { text } => text.clone(),
            ActionResult::Rich { message } => message.to_plain_text(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePair {
    pub user_message_id: i64,
    pub assistant_message_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BotEventRecord {
    pub id: i64,
    pub bot_id: i64,
    pub external_event_id: String,
    pub content: String,
    pub external_user_id: String,
    pub external_user_name: Option<String>,
    pub internal_user_id: Option<String>,
    pub message_type: String,
    pub raw_payload: String,
    pub status: BotEventStatus,
    pub action_result: Option<ActionResult>,
    pub error_message: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_retry_at: Option<f64>,
    pub conversation_id: Option<i64>,
    pub user_message_id: Option<i64>,
    pub assistant_message_id: Option<i64>,
    pub message_pairs: Vec<MessagePair>,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct NewBotEvent {
    pub bot_id: i64,
    pub external_event_id: String,
    pub content: String,
    pub external_user_id: String,
    pub external_user_name: Option<String>,
    pub internal_user_id: Option<String>,
    pub message_type: String,
    pub raw_payload: String,
    pub max_retries: i64,
}

/// 处理中间进度，重试时据此跳过已完成的步骤。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BotEventProgress {
    pub conversation_id: Option<i64>,
    pub user_message_id: Option<i64>,
    pub assistant_message_id: Option<i64>,
    pub action_result: Option<ActionResult>,
}

#[derive(Debug, Clone)]
pub struct BotEventFailure {
    pub retry_count: i64,
    pub next_retry_at: Option<f64>,
    pub error_message: String,
    pub processing_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub id: i64,
    pub bot_id: i64,
    pub external_user_id: String,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: i64,
    pub conversation_id: i64,
    pub seq: i64,
    pub role: MessageRole,
    pub content: String,
    pub created_at: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BotLogRecord {
    pub id: i64,
    pub bot_id: i64,
    pub action: String,
    pub detail: Option<String>,
    pub created_at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Sql,
    Api,
    File,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Sql => "sql",
            ActionType::Api => "api",
            ActionType::File => "file",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sql" => Some(ActionType::Sql),
            "api" => Some(ActionType::Api),
            "file" => Some(ActionType::File),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecord {
    pub id: String,
    pub name: String,
    pub action_type: ActionType,
    /// 执行器私有的配置，结构由动作类型决定。
    pub payload: Value,
    pub created_at: f64,
    pub updated_at: f64,
}

/// 同步存储接口，异步调用方通过 `spawn_blocking` 使用。
///
/// 所有事件状态变更都是带前置状态条件的 CAS 更新，返回值表示是否命中。
pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    /// 返回值为 true 表示新建。
    fn upsert_bot(&self, record: &BotRecord) -> Result<bool>;
    fn get_bot(&self, bot_id: i64) -> Result<Option<BotRecord>>;
    fn get_bot_by_webhook_token(&self, webhook_token: &str) -> Result<Option<BotRecord>>;

    fn append_bot_log(&self, bot_id: i64, action: &str, detail: Option<&str>) -> Result<()>;
    fn list_bot_logs(&self, bot_id: i64) -> Result<Vec<BotLogRecord>>;

    /// 原子插入；唯一键 (bot_id, external_event_id) 冲突时返回已有记录与 false。
    fn insert_bot_event_if_absent(&self, event: &NewBotEvent) -> Result<(BotEventRecord, bool)>;
    fn get_bot_event(&self, event_id: i64) -> Result<Option<BotEventRecord>>;
    fn get_bot_event_by_external_id(
        &self,
        bot_id: i64,
        external_event_id: &str,
    ) -> Result<Option<BotEventRecord>>;
    fn list_bot_events(&self, bot_id: i64) -> Result<Vec<BotEventRecord>>;
    /// pending 或到期的 failed -> processing；成功时返回抢占前的记录。
    fn claim_bot_event(&self, event_id: i64, now: f64) -> Result<Option<BotEventRecord>>;
    /// processing -> 抢占前状态。
    fn release_bot_event_claim(&self, event_id: i64, prior: &BotEventRecord) -> Result<bool>;
    fn save_bot_event_progress(&self, event_id: i64, progress: &BotEventProgress) -> Result<bool>;
    fn complete_bot_event(
        &self,
        event_id: i64,
        action_result: &ActionResult,
        pair: MessagePair,
        processing_time_ms: i64,
    ) -> Result<bool>;
    fn fail_bot_event(&self, event_id: i64, failure: &BotEventFailure) -> Result<bool>;
    fn list_retryable_bot_events(&self, now: f64, limit: i64) -> Result<Vec<BotEventRecord>>;
    /// 到期的 failed -> pending。
    fn rearm_bot_event(&self, event_id: i64, now: f64) -> Result<bool>;
    fn list_stale_pending_bot_events(
        &self,
        updated_before: f64,
        limit: i64,
    ) -> Result<Vec<BotEventRecord>>;

    fn get_or_create_conversation(
        &self,
        bot_id: i64,
        external_user_id: &str,
    ) -> Result<ConversationRecord>;
    fn append_message(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: &str,
    ) -> Result<MessageRecord>;
    /// 最近的 limit 条消息，按 seq 升序。
    fn list_recent_messages(&self, conversation_id: i64, limit: i64)
        -> Result<Vec<MessageRecord>>;

    fn get_bot_user_binding(&self, bot_id: i64, external_user_id: &str) -> Result<Option<String>>;
    fn upsert_bot_user_binding(
        &self,
        bot_id: i64,
        external_user_id: &str,
        internal_user_id: &str,
    ) -> Result<()>;

    fn upsert_action(&self, record: &ActionRecord) -> Result<bool>;
    fn get_action(&self, action_id: &str) -> Result<Option<ActionRecord>>;
}

/// 构建存储后端，目前仅支持 SQLite。
pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let backend = config.backend.trim().to_lowercase();
    match backend.as_str() {
        "" | "sqlite" | "default" => Ok(Arc::new(SqliteStorage::with_busy_timeout(
            config.db_path.trim().to_string(),
            config.busy_timeout_ms,
        ))),
        other => Err(anyhow!("未知存储后端: {other}")),
    }
}
