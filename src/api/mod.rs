// API 路由汇总入口：单目标代理、会话浏览与子网扫描。
pub mod browse;
pub mod errors;
pub mod proxy;
pub mod scan;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(proxy::router())
        .merge(browse::router())
        .merge(scan::router())
        .with_state(state)
}
