// 单目标代理：校验 u= 后转发一次 GET，原样返回状态码、content-type 与响应体。
use super::errors::{text_error, text_error_message};
use crate::error::LanError;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::TryStreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, warn};

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/proxy", get(proxy_entry))
}

#[derive(Debug, Deserialize)]
struct ProxyQuery {
    #[serde(default)]
    u: Option<String>,
}

async fn proxy_entry(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProxyQuery>,
) -> Response {
    let Some(raw) = query.u.filter(|value| !value.trim().is_empty()) else {
        return text_error_message("INVALID_URL", "Missing u=");
    };
    let target = match state.proxy_validator.validate(&raw).await {
        Ok(target) => target,
        Err(err) => return text_error(&err),
    };
    let client = match state.proxy_client.for_target(&target) {
        Ok(client) => client,
        Err(err) => return text_error(&err),
    };

    let upstream = match client.get(target.url().clone()).send().await {
        Ok(response) => response,
        Err(err) => {
            warn!("proxy request to {target} failed: {err}");
            return text_error(&LanError::upstream_unreachable(format!(
                "Upstream unreachable: {}",
                target.origin()
            )));
        }
    };

    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    let stream = upstream.bytes_stream().map_err(std::io::Error::other);
    stream_response(status, content_type, Body::from_stream(stream))
}

pub(super) fn stream_response(status: StatusCode, content_type: HeaderValue, body: Body) -> Response {
    match Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(body)
    {
        Ok(response) => response,
        Err(err) => {
            error!("构建代理响应失败: {err}");
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(Body::empty())
                .unwrap_or_else(|_| Response::new(Body::empty()))
        }
    }
}
