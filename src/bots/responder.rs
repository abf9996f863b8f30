use crate::bots::conversation::ConversationLinker;
use crate::bots::types::{RichField, RichMessage};
use crate::core::config::ResponderConfig;
use crate::storage::{
    ActionRecord, ActionResult, ActionType, BotEventRecord, BotRecord, ConversationRecord,
    MessageRole, StorageBackend,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct ActionContext {
    pub id: String,
    pub action_type: ActionType,
    pub payload: Value,
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn run(&self, ctx: &ActionContext) -> Result<ActionOutcome>;
}

/// 为已抢占的事件生成回复，返回的错误按处理失败进入重试流程。
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(
        &self,
        bot: &BotRecord,
        event: &BotEventRecord,
        conversation: &ConversationRecord,
    ) -> Result<ActionResult>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlashCommand {
    pub name: String,
    pub parameters: Map<String, Value>,
}

/// `/orders status=open limit=5` 解析为动作 `orders` 及字符串参数；
/// 其余词拼接为 `args` 参数，命令上的 `@botname` 后缀会被去掉。
pub fn parse_slash_command(text: &str) -> Option<SlashCommand> {
    let rest = text.trim().strip_prefix('/')?;
    let mut tokens = rest.split_whitespace();
    let head = tokens.next()?;
    let name = head.split('@').next().unwrap_or(head).trim().to_ascii_lowercase();
    if name.is_empty() {
        return None;
    }
    let mut parameters = Map::new();
    let mut args = Vec::new();
    for token in tokens {
        match token.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                parameters.insert(key.trim().to_string(), Value::String(value.to_string()));
            }
            _ => args.push(token),
        }
    }
    if !args.is_empty() {
        parameters
            .entry("args".to_string())
            .or_insert_with(|| Value::String(args.join(" ")));
    }
    Some(SlashCommand { name, parameters })
}

pub struct DefaultResponder {
    storage: Arc<dyn StorageBackend>,
    linker: ConversationLinker,
    executor: Arc<dyn ActionExecutor>,
    providers: HashMap<String, Arc<dyn AiProvider>>,
    default_provider: Option<String>,
    config: ResponderConfig,
}

impl DefaultResponder {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        linker: ConversationLinker,
        executor: Arc<dyn ActionExecutor>,
        config: ResponderConfig,
    ) -> Self {
        Self {
            storage,
            linker,
            executor,
            providers: HashMap::new(),
            default_provider: None,
            config,
        }
    }

    pub fn with_provider(mut self, id: impl Into<String>, provider: Arc<dyn AiProvider>) -> Self {
        self.providers.insert(id.into(), provider);
        self
    }

    pub fn with_default_provider(mut self, id: Option<String>) -> Self {
        self.default_provider = id.filter(|value| !value.trim().is_empty());
        self
    }

    async fn find_action(&self, bot: &BotRecord, name: &str) -> Result<Option<ActionRecord>> {
        let storage = self.storage.clone();
        let enabled = bot.enabled_action_ids.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<ActionRecord>> {
            for action_id in &enabled {
                let Some(action) = storage.get_action(action_id)? else {
                    continue;
                };
                if action.id.eq_ignore_ascii_case(&name) || action.name.eq_ignore_ascii_case(&name)
                {
                    return Ok(Some(action));
                }
            }
            Ok(None)
        })
        .await
        .unwrap_or_else(|err| Err(anyhow!(err)))
    }

    async fn run_action(&self, action: &ActionRecord, command: SlashCommand) -> Result<ActionResult> {
        let ctx = ActionContext {
            id: action.id.clone(),
            action_type: action.action_type,
            payload: action.payload.clone(),
            parameters: command.parameters,
        };
        let outcome = self.executor.run(&ctx).await?;
        if !outcome.success {
            let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
            return Err(anyhow!("action {} failed: {error}", action.id));
        }
        Ok(render_action_data(&action.name, outcome.data))
    }

    fn resolve_provider(&self, bot: &BotRecord) -> Option<Arc<dyn AiProvider>> {
        let id = bot
            .ai_provider_id
            .as_ref()
            .or(self.default_provider.as_ref())?;
        self.providers.get(id).cloned()
    }

    async fn build_prompt(&self, event: &BotEventRecord, conversation: &ConversationRecord) -> Result<String> {
        let history = self
            .linker
            .recent_messages(conversation.id, self.config.history_limit.max(0))
            .await?;
        let mut prompt = String::new();
        if !self.config.system_prompt.trim().is_empty() {
            prompt.push_str(self.config.system_prompt.trim());
            prompt.push_str("\n\n");
        }
        for message in &history {
            let speaker = match message.role {
                MessageRole::User => "User",
                MessageRole::Assistant => "Assistant",
                MessageRole::System => "System",
            };
            prompt.push_str(&format!("{speaker}: {}\n", message.content));
        }
        let ends_with_event = history
            .last()
            .map(|message| message.role == MessageRole::User && message.content == event.content)
            .unwrap_or(false);
        if !ends_with_event {
            prompt.push_str(&format!("User: {}\n", event.content));
        }
        prompt.push_str("Assistant:");
        Ok(prompt)
    }
}

#[async_trait]
impl Responder for DefaultResponder {
    async fn respond(
        &self,
        bot: &BotRecord,
        event: &BotEventRecord,
        conversation: &ConversationRecord,
    ) -> Result<ActionResult> {
        let command = parse_slash_command(&event.content);
        if let Some(command) = command.clone() {
            if let Some(action) = self.find_action(bot, &command.name).await? {
                debug!(bot_id = bot.id, event_id = event.id, action_id = %action.id, "running action");
                return self.run_action(&action, command).await;
            }
        }
        if bot.enable_query {
            let provider = self
                .resolve_provider(bot)
                .ok_or_else(|| anyhow!("no AI provider configured for bot {}", bot.id))?;
            let prompt = self.build_prompt(event, conversation).await?;
            let text = provider.generate(&prompt).await?;
            let text = text.trim();
            if text.is_empty() {
                return Err(anyhow!("AI provider returned an empty reply"));
            }
            return Ok(ActionResult::Text {
                text: text.to_string(),
            });
        }
        match command {
            Some(command) => Err(anyhow!("unknown command /{}", command.name)),
            None => Err(anyhow!(
                "bot {} has no matching action and queries are disabled",
                bot.id
            )),
        }
    }
}

/// 字符串转为文本回复；对象转为富消息，每个键一个字段。
pub fn render_action_data(action_name: &str, data: Option<Value>) -> ActionResult {
    match data {
        None | Some(Value::Null) => ActionResult::Text {
            text: format!("{action_name} completed."),
        },
        Some(Value::String(text)) => ActionResult::Text { text },
        Some(Value::Object(map)) => {
            let text = map
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let title = map
                .get("title")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some(action_name.to_string()));
            let fields = map
                .iter()
                .filter(|(key, _)| key.as_str() != "text" && key.as_str() != "title")
                .map(|(key, value)| RichField {
                    name: key.clone(),
                    value: match value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    },
                })
                .collect();
            ActionResult::Rich {
                message: RichMessage {
                    title,
                    text,
                    fields,
                    buttons: Vec::new(),
                },
            }
        }
        Some(other) => ActionResult::Text {
            text: serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
        },
    }
}

/// 通过 HTTP 执行 `api` 类动作，`sql` 与 `file` 动作由外部执行器负责。
pub struct HttpActionExecutor {
    http: Client,
}

impl HttpActionExecutor {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    async fn run(&self, ctx: &ActionContext) -> Result<ActionOutcome> {
        if ctx.action_type != ActionType::Api {
            return Ok(ActionOutcome {
                success: false,
                data: None,
                error: Some(format!(
                    "{} actions are not supported by this executor",
                    ctx.action_type.as_str()
                )),
            });
        }
        let url = ctx
            .payload
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("action {} payload.url missing", ctx.id))?;
        let method = ctx
            .payload
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .trim()
            .to_ascii_uppercase();
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| anyhow!("action {} has invalid method {method}", ctx.id))?;

        let mut request = self.http.request(method.clone(), url);
        if let Some(headers) = ctx.payload.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }
        request = if method == Method::GET {
            let query: Vec<(String, String)> = ctx
                .parameters
                .iter()
                .map(|(key, value)| {
                    let value = match value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), value)
                })
                .collect();
            request.query(&query)
        } else {
            request.json(&ctx.parameters)
        };

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Ok(ActionOutcome {
                success: false,
                data: None,
                error: Some(format!("HTTP {status}: {body}")),
            });
        }
        let data = if body.trim().is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body)))
        };
        Ok(ActionOutcome {
            success: true,
            data,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bots::types::{AdapterConfig, CustomConfig, Platform};
    use crate::storage::{BotEventStatus, SqliteStorage};
    use parking_lot::Mutex;
    use serde_json::json;

    struct RecordingExecutor {
        calls: Mutex<Vec<ActionContext>>,
    }

    #[async_trait]
    impl ActionExecutor for RecordingExecutor {
        async fn run(&self, ctx: &ActionContext) -> Result<ActionOutcome> {
            self.calls.lock().push(ctx.clone());
            Ok(ActionOutcome {
                success: true,
                data: Some(json!({ "title": "Orders", "open": 3 })),
                error: None,
            })
        }
    }

    struct EchoProvider {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AiProvider for EchoProvider {
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().push(prompt.to_string());
            Ok("  answer  ".to_string())
        }
    }

    fn bot(enable_query: bool) -> BotRecord {
        BotRecord {
            id: 1,
            name: "bot".to_string(),
            platform: Platform::Custom,
            webhook_token: "tok".to_string(),
            adapter_config: AdapterConfig::Custom(CustomConfig::default()),
            enabled_action_ids: vec!["orders".to_string()],
            enabled_datasource_ids: Vec::new(),
            ai_provider_id: None,
            enable_query,
            is_active: true,
            rate_limit: 0,
            max_retries: 3,
            request_timeout_ms: 1000,
            created_at: 0.0,
            updated_at: 0.0,
        }
    }

    fn event(content: &str) -> BotEventRecord {
        BotEventRecord {
            id: 9,
            bot_id: 1,
            external_event_id: "e".to_string(),
            content: content.to_string(),
            external_user_id: "u1".to_string(),
            external_user_name: None,
            internal_user_id: None,
            message_type: "text".to_string(),
            raw_payload: "{}".to_string(),
            status: BotEventStatus::Processing,
            action_result: None,
            error_message: None,
            processing_time_ms: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            conversation_id: None,
            user_message_id: None,
            assistant_message_id: None,
            message_pairs: Vec::new(),
            created_at: 0.0,
            updated_at: 0.0,
        }
    }

    async fn setup() -> (
        DefaultResponder,
        Arc<RecordingExecutor>,
        Arc<EchoProvider>,
        ConversationRecord,
        ConversationLinker,
    ) {
        let path = std::env::temp_dir().join(format!("bothook-resp-{}.db", uuid::Uuid::new_v4()));
        let storage: Arc<dyn StorageBackend> =
            Arc::new(SqliteStorage::new(path.to_string_lossy().to_string()));
        storage.ensure_initialized().unwrap();
        storage
            .upsert_action(&ActionRecord {
                id: "orders".to_string(),
                name: "Orders".to_string(),
                action_type: ActionType::Api,
                payload: json!({ "url": "http://localhost/orders" }),
                created_at: 0.0,
                updated_at: 0.0,
            })
            .unwrap();
        let linker = ConversationLinker::new(storage.clone());
        let executor = Arc::new(RecordingExecutor {
            calls: Mutex::new(Vec::new()),
        });
        let provider = Arc::new(EchoProvider {
            prompts: Mutex::new(Vec::new()),
        });
        let responder = DefaultResponder::new(
            storage,
            linker.clone(),
            executor.clone(),
            ResponderConfig::default(),
        )
        .with_provider("main", provider.clone())
        .with_default_provider(Some("main".to_string()));
        let conversation = linker.get_or_create(1, "u1").await.unwrap();
        (responder, executor, provider, conversation, linker)
    }

    #[test]
    fn parse_slash_command_collects_parameters() {
        let command = parse_slash_command("/Orders@shop_bot status=open north region").unwrap();
        assert_eq!(command.name, "orders");
        assert_eq!(command.parameters["status"], "open");
        assert_eq!(command.parameters["args"], "north region");
        assert!(parse_slash_command("orders").is_none());
        assert!(parse_slash_command("/ ").is_none());
    }

    #[test]
    fn render_action_data_shapes() {
        assert_eq!(
            render_action_data("Ping", None),
            ActionResult::Text {
                text: "Ping completed.".to_string()
            }
        );
        let ActionResult::Rich { message } =
            render_action_data("Orders", Some(json!({ "text": "ok", "open": 3 })))
        else {
            panic!("expected rich result");
        };
        assert_eq!(message.title.as_deref(), Some("Orders"));
        assert_eq!(message.text, "ok");
        assert_eq!(message.fields.len(), 1);
        assert_eq!(message.fields[0].value, "3");
    }

    #[tokio::test]
    async fn command_runs_enabled_action() {
        let (responder, executor, provider, conversation, _) = setup().await;
        let result = responder
            .respond(&bot(true), &event("/orders status=open"), &conversation)
            .await
            .unwrap();
        assert!(matches!(result, ActionResult::Rich { .. }));
        let calls = executor.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].parameters["status"], "open");
        assert!(provider.prompts.lock().is_empty());
    }

    #[tokio::test]
    async fn free_text_goes_to_ai_with_history() {
        let (responder, _, provider, conversation, linker) = setup().await;
        linker
            .append(conversation.id, MessageRole::User, "how many orders?")
            .await
            .unwrap();
        let result = responder
            .respond(&bot(true), &event("how many orders?"), &conversation)
            .await
            .unwrap();
        assert_eq!(
            result,
            ActionResult::Text {
                text: "answer".to_string()
            }
        );
        let prompts = provider.prompts.lock();
        assert_eq!(prompts[0].matches("User: how many orders?").count(), 1);
        assert!(prompts[0].ends_with("Assistant:"));
    }

    #[tokio::test]
    async fn disabled_query_without_action_fails() {
        let (responder, _, _, conversation, _) = setup().await;
        assert!(responder
            .respond(&bot(false), &event("hello"), &conversation)
            .await
            .is_err());
        assert!(responder
            .respond(&bot(false), &event("/unknown"), &conversation)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn http_executor_rejects_sql_actions() {
        let executor = HttpActionExecutor::new(Client::new());
        let outcome = executor
            .run(&ActionContext {
                id: "q".to_string(),
                action_type: ActionType::Sql,
                payload: Value::Null,
                parameters: Map::new(),
            })
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("sql"));
    }
}
