// SQLite 存储实现：机器人、事件、会话与审计日志。
use crate::bots::types::{AdapterConfig, Platform};
use crate::storage::{
    ActionRecord, ActionResult, ActionType, BotEventFailure, BotEventProgress, BotEventRecord,
    BotEventStatus, BotLogRecord, BotRecord, ConversationRecord, MessagePair, MessageRecord,
    MessageRole, NewBotEvent, StorageBackend,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

const BOT_COLUMNS: &str = "id, name, platform, webhook_token, adapter_config, enabled_action_ids, \
     enabled_datasource_ids, ai_provider_id, enable_query, is_active, rate_limit, max_retries, \
     request_timeout_ms, created_at, updated_at";

const BOT_EVENT_COLUMNS: &str = "id, bot_id, external_event_id, content, external_user_id, \
     external_user_name, internal_user_id, message_type, raw_payload, status, action_result, \
     error_message, processing_time_ms, retry_count, max_retries, next_retry_at, conversation_id, \
     user_message_id, assistant_message_id, message_pairs, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, seq, role, content, created_at";

pub struct SqliteStorage {
    db_path: PathBuf,
    busy_timeout: Duration,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        Self::with_busy_timeout(db_path, DEFAULT_BUSY_TIMEOUT_MS)
    }

    pub fn with_busy_timeout(db_path: String, busy_timeout_ms: u64) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/bothook.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            busy_timeout: Duration::from_millis(busy_timeout_ms.max(1)),
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        // 多个 worker 并发写入时等待锁释放，而不是立即返回 SQLITE_BUSY。
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
    }

    fn now_ts() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }

    fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn string_list_to_json(list: &[String]) -> String {
        serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
    }

    fn select_bot_event(
        conn: &Connection,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<BotEventRecord>> {
        let sql = format!("SELECT {BOT_EVENT_COLUMNS} FROM bot_events WHERE {where_clause}");
        Ok(conn
            .query_row(&sql, params, map_bot_event)
            .optional()?)
    }

    fn select_bot_events(
        conn: &Connection,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<BotEventRecord>> {
        let sql = format!("SELECT {BOT_EVENT_COLUMNS} FROM bot_events WHERE {where_clause}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, map_bot_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, message.into())
}

fn json_column<T: DeserializeOwned>(index: usize, raw: Option<String>) -> rusqlite::Result<Option<T>> {
    match raw {
        Some(text) if !text.trim().is_empty() => serde_json::from_str::<T>(&text)
            .map(Some)
            .map_err(|err| conversion_error(index, err.to_string())),
        _ => Ok(None),
    }
}

fn string_list_column(index: usize, raw: Option<String>) -> rusqlite::Result<Vec<String>> {
    Ok(json_column::<Vec<String>>(index, raw)?.unwrap_or_default())
}

fn map_bot(row: &Row<'_>) -> rusqlite::Result<BotRecord> {
    let platform: String = row.get(2)?;
    let platform = Platform::parse(&platform)
        .ok_or_else(|| conversion_error(2, format!("unknown platform {platform}")))?;
    let adapter_config = json_column::<AdapterConfig>(4, row.get(4)?)?
        .ok_or_else(|| conversion_error(4, "adapter_config missing".to_string()))?;
    Ok(BotRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        platform,
        webhook_token: row.get(3)?,
        adapter_config,
        enabled_action_ids: string_list_column(5, row.get(5)?)?,
        enabled_datasource_ids: string_list_column(6, row.get(6)?)?,
        ai_provider_id: row.get(7)?,
        enable_query: row.get::<_, i64>(8)? != 0,
        is_active: row.get::<_, i64>(9)? != 0,
        rate_limit: row.get(10)?,
        max_retries: row.get(11)?,
        request_timeout_ms: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn map_bot_event(row: &Row<'_>) -> rusqlite::Result<BotEventRecord> {
    let status: String = row.get(9)?;
    let status = BotEventStatus::parse(&status)
        .ok_or_else(|| conversion_error(9, format!("unknown event status {status}")))?;
    Ok(BotEventRecord {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        external_event_id: row.get(2)?,
        content: row.get(3)?,
        external_user_id: row.get(4)?,
        external_user_name: row.get(5)?,
        internal_user_id: row.get(6)?,
        message_type: row.get(7)?,
        raw_payload: row.get(8)?,
        status,
        action_result: json_column::<ActionResult>(10, row.get(10)?)?,
        error_message: row.get(11)?,
        processing_time_ms: row.get(12)?,
        retry_count: row.get(13)?,
        max_retries: row.get(14)?,
        next_retry_at: row.get(15)?,
        conversation_id: row.get(16)?,
        user_message_id: row.get(17)?,
        assistant_message_id: row.get(18)?,
        message_pairs: json_column::<Vec<MessagePair>>(19, row.get(19)?)?.unwrap_or_default(),
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role: String = row.get(3)?;
    let role = MessageRole::parse(&role)
        .ok_or_else(|| conversion_error(3, format!("unknown message role {role}")))?;
    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        seq: row.get(2)?,
        role,
        content: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn map_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationRecord> {
    Ok(ConversationRecord {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        external_user_id: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bots (
              id INTEGER PRIMARY KEY,
              name TEXT NOT NULL,
              platform TEXT NOT NULL,
              webhook_token TEXT NOT NULL UNIQUE,
              adapter_config TEXT NOT NULL,
              enabled_action_ids TEXT NOT NULL DEFAULT '[]',
              enabled_datasource_ids TEXT NOT NULL DEFAULT '[]',
              ai_provider_id TEXT,
              enable_query INTEGER NOT NULL DEFAULT 0,
              is_active INTEGER NOT NULL DEFAULT 1,
              rate_limit INTEGER NOT NULL DEFAULT 0,
              max_retries INTEGER NOT NULL DEFAULT 3,
              request_timeout_ms INTEGER NOT NULL DEFAULT 30000,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS bot_logs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              bot_id INTEGER NOT NULL,
              action TEXT NOT NULL,
              detail TEXT,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bot_logs_bot
              ON bot_logs (bot_id, id);
            CREATE TABLE IF NOT EXISTS bot_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              bot_id INTEGER NOT NULL,
              external_event_id TEXT NOT NULL,
              content TEXT NOT NULL,
              external_user_id TEXT NOT NULL,
              external_user_name TEXT,
              internal_user_id TEXT,
              message_type TEXT NOT NULL,
              raw_payload TEXT NOT NULL,
              status TEXT NOT NULL,
              action_result TEXT,
              error_message TEXT,
              processing_time_ms INTEGER,
              retry_count INTEGER NOT NULL DEFAULT 0,
              max_retries INTEGER NOT NULL,
              next_retry_at REAL,
              conversation_id INTEGER,
              user_message_id INTEGER,
              assistant_message_id INTEGER,
              message_pairs TEXT NOT NULL DEFAULT '[]',
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL,
              UNIQUE (bot_id, external_event_id)
            );
            CREATE INDEX IF NOT EXISTS idx_bot_events_retry
              ON bot_events (status, next_retry_at);
            CREATE INDEX IF NOT EXISTS idx_bot_events_updated
              ON bot_events (status, updated_at);
            CREATE TABLE IF NOT EXISTS conversations (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              bot_id INTEGER NOT NULL,
              external_user_id TEXT NOT NULL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL,
              UNIQUE (bot_id, external_user_id)
            );
            CREATE TABLE IF NOT EXISTS messages (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              conversation_id INTEGER NOT NULL,
              seq INTEGER NOT NULL,
              role TEXT NOT NULL,
              content TEXT NOT NULL,
              created_at REAL NOT NULL,
              UNIQUE (conversation_id, seq)
            );
            CREATE TABLE IF NOT EXISTS bot_user_bindings (
              bot_id INTEGER NOT NULL,
              external_user_id TEXT NOT NULL,
              internal_user_id TEXT NOT NULL,
              updated_at REAL NOT NULL,
              PRIMARY KEY (bot_id, external_user_id)
            );
            CREATE TABLE IF NOT EXISTS actions (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              action_type TEXT NOT NULL,
              payload TEXT NOT NULL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn upsert_bot(&self, record: &BotRecord) -> Result<bool> {
        self.ensure_initialized()?;
        let now = Self::now_ts();
        let adapter_config = Self::to_json(&record.adapter_config)?;
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = tx
            .query_row(
                "SELECT 1 FROM bots WHERE id = ?",
                params![record.id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        tx.execute(
            "INSERT INTO bots (id, name, platform, webhook_token, adapter_config, enabled_action_ids, \
             enabled_datasource_ids, ai_provider_id, enable_query, is_active, rate_limit, max_retries, \
             request_timeout_ms, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, platform = excluded.platform, \
             webhook_token = excluded.webhook_token, adapter_config = excluded.adapter_config, \
             enabled_action_ids = excluded.enabled_action_ids, \
             enabled_datasource_ids = excluded.enabled_datasource_ids, \
             ai_provider_id = excluded.ai_provider_id, enable_query = excluded.enable_query, \
             is_active = excluded.is_active, rate_limit = excluded.rate_limit, \
             max_retries = excluded.max_retries, request_timeout_ms = excluded.request_timeout_ms, \
             updated_at = excluded.updated_at",
            params![
                record.id,
                record.name,
                record.platform.as_str(),
                record.webhook_token,
                adapter_config,
                Self::string_list_to_json(&record.enabled_action_ids),
                Self::string_list_to_json(&record.enabled_datasource_ids),
                record.ai_provider_id,
                record.enable_query as i64,
                record.is_active as i64,
                record.rate_limit,
                record.max_retries,
                record.request_timeout_ms,
                now,
            ],
        )?;
        tx.commit()?;
        Ok(!exists)
    }

    fn get_bot(&self, bot_id: i64) -> Result<Option<BotRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!("SELECT {BOT_COLUMNS} FROM bots WHERE id = ?");
        Ok(conn.query_row(&sql, params![bot_id], map_bot).optional()?)
    }

    fn get_bot_by_webhook_token(&self, webhook_token: &str) -> Result<Option<BotRecord>> {
        self.ensure_initialized()?;
        let cleaned = webhook_token.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let conn = self.open()?;
        let sql = format!("SELECT {BOT_COLUMNS} FROM bots WHERE webhook_token = ?");
        Ok(conn.query_row(&sql, params![cleaned], map_bot).optional()?)
    }

    fn append_bot_log(&self, bot_id: i64, action: &str, detail: Option<&str>) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO bot_logs (bot_id, action, detail, created_at) VALUES (?, ?, ?, ?)",
            params![bot_id, action.trim(), detail, Self::now_ts()],
        )?;
        Ok(())
    }

    fn list_bot_logs(&self, bot_id: i64) -> Result<Vec<BotLogRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, bot_id, action, detail, created_at FROM bot_logs WHERE bot_id = ? ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![bot_id], |row| {
                Ok(BotLogRecord {
                    id: row.get(0)?,
                    bot_id: row.get(1)?,
                    action: row.get(2)?,
                    detail: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn insert_bot_event_if_absent(&self, event: &NewBotEvent) -> Result<(BotEventRecord, bool)> {
        self.ensure_initialized()?;
        let now = Self::now_ts();
        let conn = self.open()?;
        // 唯一键冲突时不写入，由数据库保证并发重复投递只落一条。
        let inserted = conn.execute(
            "INSERT INTO bot_events (bot_id, external_event_id, content, external_user_id, \
             external_user_name, internal_user_id, message_type, raw_payload, status, retry_count, \
             max_retries, message_pairs, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', 0, ?9, '[]', ?10, ?10) \
             ON CONFLICT(bot_id, external_event_id) DO NOTHING",
            params![
                event.bot_id,
                event.external_event_id,
                event.content,
                event.external_user_id,
                event.external_user_name,
                event.internal_user_id,
                event.message_type,
                event.raw_payload,
                event.max_retries.max(0),
                now,
            ],
        )?;
        let record = Self::select_bot_event(
            &conn,
            "bot_id = ? AND external_event_id = ?",
            params![event.bot_id, event.external_event_id],
        )?
        .ok_or_else(|| anyhow!("bot event vanished after insert: {}", event.external_event_id))?;
        Ok((record, inserted > 0))
    }

    fn get_bot_event(&self, event_id: i64) -> Result<Option<BotEventRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        Self::select_bot_event(&conn, "id = ?", params![event_id])
    }

    fn get_bot_event_by_external_id(
        &self,
        bot_id: i64,
        external_event_id: &str,
    ) -> Result<Option<BotEventRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        Self::select_bot_event(
            &conn,
            "bot_id = ? AND external_event_id = ?",
            params![bot_id, external_event_id],
        )
    }

    fn list_bot_events(&self, bot_id: i64) -> Result<Vec<BotEventRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        Self::select_bot_events(&conn, "bot_id = ? ORDER BY id ASC", params![bot_id])
    }

    fn claim_bot_event(&self, event_id: i64, now: f64) -> Result<Option<BotEventRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(snapshot) = Self::select_bot_event(&tx, "id = ?", params![event_id])? else {
            tx.commit()?;
            return Ok(None);
        };
        let changed = tx.execute(
            "UPDATE bot_events SET status = 'processing', next_retry_at = NULL, updated_at = ?2 \
             WHERE id = ?1 AND (status = 'pending' OR (status = 'failed' \
             AND retry_count < max_retries AND next_retry_at IS NOT NULL AND next_retry_at <= ?2))",
            params![event_id, now],
        )?;
        tx.commit()?;
        Ok((changed == 1).then_some(snapshot))
    }

    fn release_bot_event_claim(&self, event_id: i64, prior: &BotEventRecord) -> Result<bool> {
        self.ensure_initialized()?;
        let (status, next_retry_at) = match prior.status {
            BotEventStatus::Failed if prior.retry_count < prior.max_retries => {
                (BotEventStatus::Failed, prior.next_retry_at)
            }
            BotEventStatus::Failed => (BotEventStatus::Failed, None),
            _ => (BotEventStatus::Pending, None),
        };
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE bot_events SET status = ?2, next_retry_at = ?3, updated_at = ?4 \
             WHERE id = ?1 AND status = 'processing'",
            params![event_id, status.as_str(), next_retry_at, Self::now_ts()],
        )?;
        Ok(changed == 1)
    }

    fn save_bot_event_progress(&self, event_id: i64, progress: &BotEventProgress) -> Result<bool> {
        self.ensure_initialized()?;
        let action_result = progress
            .action_result
            .as_ref()
            .map(Self::to_json)
            .transpose()?;
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE bot_events SET conversation_id = ?2, user_message_id = ?3, \
             assistant_message_id = ?4, action_result = ?5, updated_at = ?6 \
             WHERE id = ?1 AND status = 'processing'",
            params![
                event_id,
                progress.conversation_id,
                progress.user_message_id,
                progress.assistant_message_id,
                action_result,
                Self::now_ts(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn complete_bot_event(
        &self,
        event_id: i64,
        action_result: &ActionResult,
        pair: MessagePair,
        processing_time_ms: i64,
    ) -> Result<bool> {
        self.ensure_initialized()?;
        let action_result = Self::to_json(action_result)?;
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT status, message_pairs FROM bot_events WHERE id = ?",
                params![event_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((status, pairs)) = current else {
            tx.commit()?;
            return Ok(false);
        };
        if status != BotEventStatus::Processing.as_str() {
            tx.commit()?;
            return Ok(false);
        }
        let mut pairs: Vec<MessagePair> = pairs
            .filter(|text| !text.trim().is_empty())
            .map(|text| serde_json::from_str(&text))
            .transpose()?
            .unwrap_or_default();
        if !pairs.contains(&pair) {
            pairs.push(pair);
        }
        tx.execute(
            "UPDATE bot_events SET status = 'completed', action_result = ?2, message_pairs = ?3, \
             processing_time_ms = ?4, error_message = NULL, next_retry_at = NULL, \
             user_message_id = ?5, assistant_message_id = ?6, updated_at = ?7 \
             WHERE id = ?1 AND status = 'processing'",
            params![
                event_id,
                action_result,
                Self::to_json(&pairs)?,
                processing_time_ms,
                pair.user_message_id,
                pair.assistant_message_id,
                Self::now_ts(),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn fail_bot_event(&self, event_id: i64, failure: &BotEventFailure) -> Result<bool> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        // retry_count 不超过 max_retries；只有仍可重试时才保留 next_retry_at。
        let changed = conn.execute(
            "UPDATE bot_events SET status = 'failed', \
             retry_count = MIN(?2, max_retries), \
             next_retry_at = CASE WHEN MIN(?2, max_retries) < max_retries THEN ?3 ELSE NULL END, \
             error_message = ?4, processing_time_ms = ?5, updated_at = ?6 \
             WHERE id = ?1 AND status = 'processing'",
            params![
                event_id,
                failure.retry_count.max(0),
                failure.next_retry_at,
                failure.error_message,
                failure.processing_time_ms,
                Self::now_ts(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn list_retryable_bot_events(&self, now: f64, limit: i64) -> Result<Vec<BotEventRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        Self::select_bot_events(
            &conn,
            "status = 'failed' AND retry_count < max_retries AND next_retry_at IS NOT NULL \
             AND next_retry_at <= ? ORDER BY next_retry_at ASC, id ASC LIMIT ?",
            params![now, limit.max(1)],
        )
    }

    fn rearm_bot_event(&self, event_id: i64, now: f64) -> Result<bool> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE bot_events SET status = 'pending', next_retry_at = NULL, updated_at = ?2 \
             WHERE id = ?1 AND status = 'failed' AND retry_count < max_retries \
             AND next_retry_at IS NOT NULL AND next_retry_at <= ?2",
            params![event_id, now],
        )?;
        Ok(changed == 1)
    }

    fn list_stale_pending_bot_events(
        &self,
        updated_before: f64,
        limit: i64,
    ) -> Result<Vec<BotEventRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        Self::select_bot_events(
            &conn,
            "status = 'pending' AND updated_at <= ? ORDER BY id ASC LIMIT ?",
            params![updated_before, limit.max(1)],
        )
    }

    fn get_or_create_conversation(
        &self,
        bot_id: i64,
        external_user_id: &str,
    ) -> Result<ConversationRecord> {
        self.ensure_initialized()?;
        let now = Self::now_ts();
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO conversations (bot_id, external_user_id, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?3) ON CONFLICT(bot_id, external_user_id) DO NOTHING",
            params![bot_id, external_user_id, now],
        )?;
        conn.query_row(
            "SELECT id, bot_id, external_user_id, created_at, updated_at FROM conversations \
             WHERE bot_id = ? AND external_user_id = ?",
            params![bot_id, external_user_id],
            map_conversation,
        )
        .optional()?
        .ok_or_else(|| anyhow!("conversation missing after upsert: bot_id={bot_id}"))
    }

    fn append_message(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: &str,
    ) -> Result<MessageRecord> {
        self.ensure_initialized()?;
        let now = Self::now_ts();
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?",
            params![conversation_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO messages (conversation_id, seq, role, content, created_at) VALUES (?, ?, ?, ?, ?)",
            params![conversation_id, seq, role.as_str(), content, now],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE conversations SET updated_at = ? WHERE id = ?",
            params![now, conversation_id],
        )?;
        tx.commit()?;
        Ok(MessageRecord {
            id,
            conversation_id,
            seq,
            role,
            content: content.to_string(),
            created_at: now,
        })
    }

    fn list_recent_messages(
        &self,
        conversation_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        self.ensure_initialized()?;
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY seq DESC LIMIT ?"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt
            .query_map(params![conversation_id, limit], map_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    fn get_bot_user_binding(&self, bot_id: i64, external_user_id: &str) -> Result<Option<String>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        Ok(conn
            .query_row(
                "SELECT internal_user_id FROM bot_user_bindings WHERE bot_id = ? AND external_user_id = ?",
                params![bot_id, external_user_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn upsert_bot_user_binding(
        &self,
        bot_id: i64,
        external_user_id: &str,
        internal_user_id: &str,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO bot_user_bindings (bot_id, external_user_id, internal_user_id, updated_at) \
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT(bot_id, external_user_id) DO UPDATE SET \
             internal_user_id = excluded.internal_user_id, updated_at = excluded.updated_at",
            params![bot_id, external_user_id, internal_user_id, Self::now_ts()],
        )?;
        Ok(())
    }

    fn upsert_action(&self, record: &ActionRecord) -> Result<bool> {
        self.ensure_initialized()?;
        let now = Self::now_ts();
        let payload = Self::to_json(&record.payload)?;
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = tx
            .query_row(
                "SELECT 1 FROM actions WHERE id = ?",
                params![record.id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        tx.execute(
            "INSERT INTO actions (id, name, action_type, payload, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5) ON CONFLICT(id) DO UPDATE SET name = excluded.name, \
             action_type = excluded.action_type, payload = excluded.payload, \
             updated_at = excluded.updated_at",
            params![record.id, record.name, record.action_type.as_str(), payload, now],
        )?;
        tx.commit()?;
        Ok(!exists)
    }

    fn get_action(&self, action_id: &str) -> Result<Option<ActionRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        Ok(conn
            .query_row(
                "SELECT id, name, action_type, payload, created_at, updated_at FROM actions WHERE id = ?",
                params![action_id],
                |row| {
                    let action_type: String = row.get(2)?;
                    let action_type = ActionType::parse(&action_type).ok_or_else(|| {
                        conversion_error(2, format!("unknown action type {action_type}"))
                    })?;
                    Ok(ActionRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        action_type,
                        payload: json_column::<Value>(3, row.get(3)?)?.unwrap_or(Value::Null),
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bots::types::CustomConfig;

    fn storage() -> SqliteStorage {
        let path = std::env::temp_dir().join(format!("bothook-sqlite-{}.db", uuid::Uuid::new_v4()));
        let storage = SqliteStorage::new(path.to_string_lossy().to_string());
        storage.ensure_initialized().unwrap();
        storage
    }

    fn bot(id: i64, token: &str) -> BotRecord {
        BotRecord {
            id,
            name: format!("bot-{id}"),
            platform: Platform::Custom,
            webhook_token: token.to_string(),
            adapter_config: AdapterConfig::Custom(CustomConfig::default()),
            enabled_action_ids: vec!["orders".to_string()],
            enabled_datasource_ids: Vec::new(),
            ai_provider_id: None,
            enable_query: false,
            is_active: true,
            rate_limit: 0,
            max_retries: 3,
            request_timeout_ms: 1000,
            created_at: 0.0,
            updated_at: 0.0,
        }
    }

    fn new_event(bot_id: i64, external_event_id: &str) -> NewBotEvent {
        NewBotEvent {
            bot_id,
            external_event_id: external_event_id.to_string(),
            content: "hello".to_string(),
            external_user_id: "u1".to_string(),
            external_user_name: None,
            internal_user_id: None,
            message_type: "text".to_string(),
            raw_payload: "{}".to_string(),
            max_retries: 2,
        }
    }

    #[test]
    fn upsert_bot_reports_creation_once() {
        let storage = storage();
        assert!(storage.upsert_bot(&bot(1, "tok-1")).unwrap());
        let mut updated = bot(1, "tok-2");
        updated.is_active = false;
        assert!(!storage.upsert_bot(&updated).unwrap());
        assert!(storage.get_bot_by_webhook_token("tok-1").unwrap().is_none());
        let loaded = storage.get_bot_by_webhook_token("tok-2").unwrap().unwrap();
        assert!(!loaded.is_active);
        assert_eq!(loaded.enabled_action_ids, vec!["orders".to_string()]);
    }

    #[test]
    fn duplicate_event_insert_returns_existing_row() {
        let storage = storage();
        let (first, inserted) = storage.insert_bot_event_if_absent(&new_event(1, "m-1")).unwrap();
        assert!(inserted);
        assert_eq!(first.status, BotEventStatus::Pending);
        let (second, inserted) = storage.insert_bot_event_if_absent(&new_event(1, "m-1")).unwrap();
        assert!(!inserted);
        assert_eq!(second.id, first.id);
        let (other_bot, inserted) = storage.insert_bot_event_if_absent(&new_event(2, "m-1")).unwrap();
        assert!(inserted);
        assert_ne!(other_bot.id, first.id);
    }

    #[test]
    fn claim_is_exclusive_and_release_restores_status() {
        let storage = storage();
        let (event, _) = storage.insert_bot_event_if_absent(&new_event(1, "m-2")).unwrap();
        let now = SqliteStorage::now_ts();
        let prior = storage.claim_bot_event(event.id, now).unwrap().unwrap();
        assert_eq!(prior.status, BotEventStatus::Pending);
        assert!(storage.claim_bot_event(event.id, now).unwrap().is_none());
        assert!(storage.release_bot_event_claim(event.id, &prior).unwrap());
        let restored = storage.get_bot_event(event.id).unwrap().unwrap();
        assert_eq!(restored.status, BotEventStatus::Pending);
    }

    #[test]
    fn fail_clamps_retry_count_and_clears_next_retry_when_exhausted() {
        let storage = storage();
        let (event, _) = storage.insert_bot_event_if_absent(&new_event(1, "m-3")).unwrap();
        let now = SqliteStorage::now_ts();
        storage.claim_bot_event(event.id, now).unwrap().unwrap();
        assert!(storage
            .fail_bot_event(
                event.id,
                &BotEventFailure {
                    retry_count: 5,
                    next_retry_at: Some(now + 10.0),
                    error_message: "boom".to_string(),
                    processing_time_ms: 3,
                },
            )
            .unwrap());
        let failed = storage.get_bot_event(event.id).unwrap().unwrap();
        assert_eq!(failed.retry_count, 2);
        assert_eq!(failed.next_retry_at, None);
        assert!(storage.claim_bot_event(event.id, now + 100.0).unwrap().is_none());
    }

    #[test]
    fn rearm_only_after_next_retry_at() {
        let storage = storage();
        let (event, _) = storage.insert_bot_event_if_absent(&new_event(1, "m-4")).unwrap();
        let now = SqliteStorage::now_ts();
        storage.claim_bot_event(event.id, now).unwrap().unwrap();
        storage
            .fail_bot_event(
                event.id,
                &BotEventFailure {
                    retry_count: 1,
                    next_retry_at: Some(now + 60.0),
                    error_message: "timeout".to_string(),
                    processing_time_ms: 1,
                },
            )
            .unwrap();
        assert!(storage.list_retryable_bot_events(now, 10).unwrap().is_empty());
        assert!(!storage.rearm_bot_event(event.id, now).unwrap());
        assert_eq!(storage.list_retryable_bot_events(now + 61.0, 10).unwrap().len(), 1);
        assert!(storage.rearm_bot_event(event.id, now + 61.0).unwrap());
        let rearmed = storage.get_bot_event(event.id).unwrap().unwrap();
        assert_eq!(rearmed.status, BotEventStatus::Pending);
        assert_eq!(rearmed.next_retry_at, None);
    }

    #[test]
    fn complete_records_pair_and_result() {
        let storage = storage();
        let (event, _) = storage.insert_bot_event_if_absent(&new_event(1, "m-5")).unwrap();
        storage.claim_bot_event(event.id, SqliteStorage::now_ts()).unwrap().unwrap();
        let pair = MessagePair {
            user_message_id: 10,
            assistant_message_id: 11,
        };
        let result = ActionResult::Text {
            text: "done".to_string(),
        };
        assert!(storage.complete_bot_event(event.id, &result, pair, 42).unwrap());
        assert!(!storage.complete_bot_event(event.id, &result, pair, 42).unwrap());
        let done = storage.get_bot_event(event.id).unwrap().unwrap();
        assert_eq!(done.status, BotEventStatus::Completed);
        assert_eq!(done.message_pairs, vec![pair]);
        assert_eq!(done.action_result, Some(result));
        assert_eq!(done.processing_time_ms, Some(42));
    }

    #[test]
    fn messages_append_in_sequence() {
        let storage = storage();
        let conversation = storage.get_or_create_conversation(1, "u1").unwrap();
        assert_eq!(
            storage.get_or_create_conversation(1, "u1").unwrap().id,
            conversation.id
        );
        for index in 0..4 {
            storage
                .append_message(conversation.id, MessageRole::User, &format!("m{index}"))
                .unwrap();
        }
        let recent = storage.list_recent_messages(conversation.id, 2).unwrap();
        let seqs: Vec<i64> = recent.iter().map(|message| message.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(recent[1].content, "m3");
    }
}
