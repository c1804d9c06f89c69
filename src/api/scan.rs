// 子网扫描：选网卡、推导主机范围、并发探测并返回识别到的矿机。
use super::errors::json_error;
use crate::scanner::{DeviceScanner, HttpProber};
use crate::state::AppState;
use crate::subnet::{derive_range, select_interface, system_interfaces};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tracing::warn;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/scan", get(scan_subnet))
}

async fn scan_subnet(State(state): State<Arc<AppState>>) -> Response {
    let interface = match system_interfaces().and_then(|items| select_interface(&items)) {
        Ok(interface) => interface,
        Err(err) => {
            warn!("scan aborted: {err}");
            return json_error(&err);
        }
    };
    let settings = &state.config.scan;
    let range = derive_range(&interface, settings.max_hosts);
    let scanner = DeviceScanner::new(HttpProber::new(state.scan_client.clone(), settings), settings);
    Json(scanner.scan(interface, &range).await).into_response()
}
