use crate::storage::{ConversationRecord, MessageRecord, MessageRole, StorageBackend};
use anyhow::{anyhow, Result};
use std::sync::Arc;

/// 将 `(bot_id, external_user_id)` 映射到唯一的持久会话。
#[derive(Clone)]
pub struct ConversationLinker {
    storage: Arc<dyn StorageBackend>,
}

impl ConversationLinker {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// 以该组合为键 upsert，并发的首次消息最终落到同一行。
    pub async fn get_or_create(
        &self,
        bot_id: i64,
        external_user_id: &str,
    ) -> Result<ConversationRecord> {
        let external_user_id = external_user_id.trim().to_string();
        if external_user_id.is_empty() {
            return Err(anyhow!("external user id is empty"));
        }
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || {
            storage.get_or_create_conversation(bot_id, &external_user_id)
        })
        .await
        .unwrap_or_else(|err| Err(anyhow!(err)))
    }

    pub async fn append(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: &str,
    ) -> Result<MessageRecord> {
        let storage = self.storage.clone();
        let content = content.to_string();
        tokio::task::spawn_blocking(move || storage.append_message(conversation_id, role, &content))
            .await
            .unwrap_or_else(|err| Err(anyhow!(err)))
    }

    pub async fn recent_messages(
        &self,
        conversation_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || storage.list_recent_messages(conversation_id, limit))
            .await
            .unwrap_or_else(|err| Err(anyhow!(err)))
    }
}
