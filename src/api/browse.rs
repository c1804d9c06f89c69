// 会话浏览入口：/browse/<id>/... 的每个请求都重新校验目标，再转发到设备并改写响应。
use super::errors::{text_error, text_error_message};
use super::proxy::stream_response;
use crate::browse::{
    browse_prefix, decode_origin, encode_origin, is_html, rewrite_html, rewrite_location,
    split_browse_path, BROWSE_ROOT,
};
use crate::error::LanError;
use crate::state::AppState;
use axum::body::{to_bytes, Body};
use axum::extract::{Query, Request, State};
use axum::http::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, LOCATION, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{any, get};
use axum::Router;
use futures::TryStreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

const FORWARDED_HEADERS: [axum::http::HeaderName; 4] =
    [USER_AGENT, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE];

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(BROWSE_ROOT, get(browse_open))
        .route("/browse/{id}", any(browse_entry))
        .route("/browse/{id}/", any(browse_entry))
        .route("/browse/{id}/{*path}", any(browse_entry))
}

#[derive(Debug, Deserialize)]
struct BrowseOpenQuery {
    #[serde(default)]
    u: Option<String>,
}

/// `GET /browse?u=`：校验后跳转到对应的会话前缀。
async fn browse_open(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BrowseOpenQuery>,
) -> Response {
    let Some(raw) = query.u.filter(|value| !value.trim().is_empty()) else {
        return text_error_message("INVALID_URL", "Missing u=");
    };
    match state.browse_validator.validate(&raw).await {
        Ok(target) => {
            let id = encode_origin(&target);
            let location = format!("{}{}", browse_prefix(&id), target.path);
            redirect_response(StatusCode::FOUND, &location, None)
        }
        Err(err) => {
            warn!("browse entry rejected: {err}");
            text_error(&err)
        }
    }
}

async fn browse_entry(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    let Some(browse_path) = split_browse_path(&path) else {
        return text_error(&LanError::invalid_url("Invalid browse path"));
    };
    let id = browse_path.id.to_string();
    let Some(suffix) = browse_path.suffix else {
        let mut location = format!("{}/", browse_prefix(&id));
        if let Some(query) = &query {
            location.push('?');
            location.push_str(query);
        }
        return Redirect::permanent(&location).into_response();
    };

    let Some(origin) = decode_origin(&id) else {
        return text_error(&LanError::invalid_url("Invalid browse id"));
    };
    let target = match state.browse_validator.validate(&origin).await {
        Ok(target) => target,
        Err(err) => {
            warn!("browse target rejected: {err}");
            return text_error(&err);
        }
    };

    let mut upstream_url = format!("{}{}", target.origin(), suffix);
    if let Some(query) = &query {
        upstream_url.push('?');
        upstream_url.push_str(query);
    }
    let upstream_url = match url::Url::parse(&upstream_url) {
        Ok(url) => url,
        Err(_) => return text_error(&LanError::invalid_url("Invalid browse path")),
    };

    let payload = match to_bytes(body, state.browse_client.max_body_bytes()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!("read browse request body failed: {err}");
            return text_error_message("BODY_TOO_LARGE", "Request body too large");
        }
    };
    let client = match state.browse_client.for_target(&target) {
        Ok(client) => client,
        Err(err) => return text_error(&err),
    };

    let mut request = client
        .request(parts.method.clone(), upstream_url.clone())
        .headers(forwarded_headers(&parts.headers));
    if !payload.is_empty() {
        request = request.body(payload);
    }
    let upstream = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            warn!("browse request to {upstream_url} failed: {err}");
            return text_error(&LanError::upstream_unreachable(format!(
                "Upstream unreachable: {}",
                target.origin()
            )));
        }
    };

    let prefix = browse_prefix(&id);
    let status = upstream.status();
    let content_type = upstream.headers().get(CONTENT_TYPE).cloned();

    if status.is_redirection() {
        if let Some(location) = upstream
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
        {
            let rewritten = rewrite_location(location, upstream.url(), &prefix);
            return redirect_response(status, &rewritten, content_type);
        }
    }

    let content_type =
        content_type.unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    let html = content_type.to_str().map(is_html).unwrap_or(false);
    if html {
        let limit = state.browse_client.max_body_bytes();
        return match read_capped(upstream, limit).await {
            Ok(page) => {
                let body = Body::from(rewrite_html(&page, &prefix));
                stream_response(status, content_type, body)
            }
            Err(err) => {
                warn!("read html from {upstream_url} failed: {err}");
                text_error(&err)
            }
        };
    }
    let stream = upstream.bytes_stream().map_err(std::io::Error::other);
    stream_response(status, content_type, Body::from_stream(stream))
}

/// HTML 需要整页改写，读取时受 `max_body_bytes` 限制。
async fn read_capped(response: reqwest::Response, limit: usize) -> Result<Vec<u8>, LanError> {
    let origin = response.url().origin().ascii_serialization();
    let mut page = Vec::new();
    let mut stream = response.bytes_stream();
    loop {
        match stream.try_next().await {
            Ok(Some(chunk)) => {
                if page.len() + chunk.len() > limit {
                    return Err(LanError::upstream_unreachable(format!(
                        "Upstream page too large: {origin}"
                    )));
                }
                page.extend_from_slice(&chunk);
            }
            Ok(None) => return Ok(page),
            Err(err) => {
                debug!("html body stream from {origin} broke: {err}");
                return Err(LanError::upstream_unreachable(format!(
                    "Upstream unreachable: {origin}"
                )));
            }
        }
    }
}

fn forwarded_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in FORWARDED_HEADERS {
        if let Some(value) = incoming.get(&name) {
            headers.insert(name, value.clone());
        }
    }
    headers
}

fn redirect_response(
    status: StatusCode,
    location: &str,
    content_type: Option<HeaderValue>,
) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    match HeaderValue::from_str(location) {
        Ok(value) => {
            response.headers_mut().insert(LOCATION, value);
        }
        Err(_) => {
            return text_error(&LanError::upstream_unreachable("Invalid upstream redirect"));
        }
    }
    if let Some(content_type) = content_type {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}
