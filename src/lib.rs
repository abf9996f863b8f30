// 库入口，供集成测试与内部复用。
mod api;
pub mod bots;
mod core;
mod services;
pub mod storage;

pub use api::build_router;
pub use crate::core::{config, shutdown, state};
pub use crate::services::llm;
