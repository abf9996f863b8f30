// API 路由汇总入口。
pub mod bot_webhook;
pub mod errors;

use crate::core::state::AppState;
use axum::extract::DefaultBodyLimit;
use axum::Router;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.max_body_bytes.max(1024);
    Router::new()
        .merge(bot_webhook::router())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
