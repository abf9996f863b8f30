// 机器人 Webhook 管线：平台适配、事件入库去重、处理状态机与重试调度。
pub mod adapter;
pub mod conversation;
pub mod custom;
pub mod discord;
pub mod errors;
pub mod ingest;
pub mod processor;
pub mod rate_limit;
pub mod registry;
pub mod responder;
pub mod retry;
pub mod slack;
pub mod telegram;
pub mod types;
pub mod wecom;

pub use adapter::BotAdapter;
pub use conversation::ConversationLinker;
pub use errors::BotError;
pub use ingest::{IngestOutcome, WebhookIngestor};
pub use processor::{EventProcessor, ProcessOutcome};
pub use rate_limit::BotRateLimiter;
pub use registry::{build_default_adapter_registry, AdapterFactory, AdapterRegistry};
pub use responder::{DefaultResponder, HttpActionExecutor, Responder};
pub use retry::{BackoffPolicy, RetryScheduler, TickReport};
pub use types::{AdapterConfig, ParsedMessage, Platform, RichMessage, WebhookRequest};
