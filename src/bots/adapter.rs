use crate::bots::types::{AdapterConfig, ParsedMessage, Platform, RichMessage, WebhookRequest};
use anyhow::Result;
use async_trait::async_trait;

/// 平台适配器：在平台 Webhook 与 [`ParsedMessage`] 之间互相转换。
///
/// 入站方法为同步调用，遇到畸形输入不得报错：
/// `verify_signature` 返回 `false`，`handle_challenge` 返回 `None`。
/// 出站方法调用平台 API 并向上传递错误。
#[async_trait]
pub trait BotAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// 使用机器人保存的配置完成一次性初始化。
    async fn init(&mut self, config: &AdapterConfig) -> Result<()>;

    fn verify_signature(&self, request: &WebhookRequest<'_>) -> bool;

    /// 握手探测请求返回需要原样回显的响应体。
    fn handle_challenge(&self, _request: &WebhookRequest<'_>) -> Option<String> {
        None
    }

    /// 非用户消息（回执、系统事件）返回 `Ok(None)`。
    fn parse_message(&self, request: &WebhookRequest<'_>) -> Result<Option<ParsedMessage>>;

    /// 确认用户消息时返回给平台的响应体。
    fn ack_body(&self, _message: &ParsedMessage) -> Option<String> {
        None
    }

    async fn send_reply(&self, external_user_id: &str, text: &str) -> Result<()>;

    async fn send_rich_message(&self, external_user_id: &str, message: &RichMessage) -> Result<()> {
        self.send_reply(external_user_id, &message.to_plain_text())
            .await
    }

    async fn send_error(&self, external_user_id: &str, error: &str) -> Result<()> {
        self.send_reply(external_user_id, &format!("Sorry, something went wrong: {error}"))
            .await
    }
}
