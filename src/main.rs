// 服务入口：加载配置、初始化日志、挂载 Webhook 路由并启动重试调度器。
use bothook_server::config::{load_config, Config};
use bothook_server::shutdown::shutdown_signal;
use bothook_server::state::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    init_tracing(&config);
    let state = Arc::new(AppState::new(config.clone())?);

    let cancel = CancellationToken::new();
    let worker = state.scheduler.clone().spawn(cancel.clone());

    let app = bothook_server::build_router(state.clone()).layer(TraceLayer::new_for_http());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("Webhook 服务已启动: http://{addr}");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("服务退出异常: {err}");
    }

    // 停机时等待当前调度轮次结束。
    cancel.cancel();
    if let Err(err) = worker.await {
        warn!("重试调度器退出异常: {err}");
    }
    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    if config
        .observability
        .log_format
        .trim()
        .eq_ignore_ascii_case("json")
    {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
