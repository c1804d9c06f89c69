// 服务入口：加载配置、挂载 API 与静态页面，监听直到收到退出信号。
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::FutureExt;
use minerlan::config::{load_config, Config};
use minerlan::shutdown::shutdown_signal;
use minerlan::state::AppState;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    init_tracing(&config);
    let state = Arc::new(AppState::new(config.clone())?);

    let app = minerlan::build_router(state);
    let app = mount_static(app, &config.server.static_dir);
    let app = app
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(panic_guard));

    let addr = bind_address(&config);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("LAN proxy listening on http://{addr}");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("server exited with error: {err}");
    }
    info!("LAN proxy stopped");
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
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn bind_address(config: &Config) -> String {
    // 容器部署时由环境变量指定监听地址。
    let host = std::env::var("MINERLAN_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}

/// 静态页面作为兜底路由，API 路径优先匹配。
fn mount_static(app: Router, dir: &str) -> Router {
    let path = PathBuf::from(dir);
    if path.exists() {
        let service = ServeDir::new(path).append_index_html_on_directories(true);
        app.fallback_service(service)
    } else {
        warn!("static dir {dir} not found, UI disabled");
        app
    }
}

async fn panic_guard(request: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let result = AssertUnwindSafe(next.run(request)).catch_unwind().await;
    match result {
        Ok(response) => Ok(response),
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!("panic while handling {method} {path}: {detail}");
            Ok((StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
