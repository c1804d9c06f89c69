use crate::error::LanError;
use axum::http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

pub(crate) const TRACE_HEADER: &str = "x-trace-id";
pub(crate) const ERROR_CODE_HEADER: &str = "x-error-code";

/// 代理入口的错误：400 + 纯文本原因。
pub fn text_error(err: &LanError) -> Response {
    let response = (
        StatusCode::BAD_REQUEST,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        err.message().to_string(),
    )
        .into_response();
    with_error_headers(response, err.code())
}

pub fn text_error_message(code: &str, message: &str) -> Response {
    let response = (
        StatusCode::BAD_REQUEST,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        message.to_string(),
    )
        .into_response();
    with_error_headers(response, code)
}

/// JSON 接口的错误：400 + `{ "error": message }`。
pub fn json_error(err: &LanError) -> Response {
    let response = (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": err.message() })),
    )
        .into_response();
    with_error_headers(response, err.code())
}

fn with_error_headers(mut response: Response, code: &str) -> Response {
    let trace_id = format!("err_{}", Uuid::new_v4().simple());
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TRACE_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(code) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(ERROR_CODE_HEADER), value);
    }
    response
}
