use crate::bots::BotError;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;
use uuid::Uuid;

pub(crate) const TRACE_HEADER: &str = "x-trace-id";
pub(crate) const ERROR_CODE_HEADER: &str = "x-error-code";

#[derive(Debug, Clone)]
pub(crate) struct ErrorMeta {
    pub code: String,
    pub message: String,
    pub status: u16,
    pub hint: String,
    pub trace_id: String,
    pub timestamp: f64,
}

impl ErrorMeta {
    pub(crate) fn to_value(&self) -> Value {
        json!({
            "code": self.code,
            "message": self.message,
            "status": self.status,
            "hint": self.hint,
            "trace_id": self.trace_id,
            "timestamp": self.timestamp,
        })
    }
}

pub(crate) fn build_error_meta(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
) -> ErrorMeta {
    ErrorMeta {
        code: code.to_string(),
        message: message.into(),
        status: status.as_u16(),
        hint: hint_for_error_code(code)
            .unwrap_or_else(|| default_hint(status))
            .to_string(),
        trace_id: format!("err_{}", Uuid::new_v4().simple()),
        timestamp: now_unix_seconds(),
    }
}

fn hint_for_error_code(code: &str) -> Option<&'static str> {
    match code {
        "BOT_NOT_FOUND" => Some("Check the webhook URL configured on the platform."),
        "BOT_INACTIVE" => Some("Activate the bot before sending webhooks to it."),
        "INVALID_SIGNATURE" => Some("Verify the signing secret shared with the platform."),
        "INVALID_PAYLOAD" => Some("Check required fields and payload schema before retrying."),
        "ADAPTER_NOT_REGISTERED" | "ADAPTER_CONFIG_INVALID" => {
            Some("Review the bot's platform and adapter settings.")
        }
        "RATE_LIMITED" => Some("Retry later or reduce request frequency."),
        _ => None,
    }
}

pub fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let meta = build_error_meta(status, code, message);
    let mut response = (status, Json(json!({ "detail": meta.to_value() }))).into_response();
    if let Ok(value) = HeaderValue::from_str(&meta.trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TRACE_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.code) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(ERROR_CODE_HEADER), value);
    }
    response
}

/// 服务端错误记录原因后只对外返回通用提示。
pub fn bot_error_response(err: &BotError) -> Response {
    let status = err.status();
    if status.is_server_error() {
        error!(code = err.code(), "webhook request failed: {err}");
        return error_response(status, err.code(), "internal error");
    }
    error_response(status, err.code(), err.to_string())
}

impl IntoResponse for BotError {
    fn into_response(self) -> Response {
        bot_error_response(&self)
    }
}

fn default_hint(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "Verify request parameters and payload format.",
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            "Check authentication credentials and permission scope."
        }
        StatusCode::NOT_FOUND => "Verify requested resource path or identifier.",
        StatusCode::TOO_MANY_REQUESTS => "Retry later or reduce request frequency.",
        _ if status.is_server_error() => "Retry later or contact support with trace_id.",
        _ => "Inspect request and try again.",
    }
}

fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn bot_error_renders_detail_envelope() {
        let response = BotError::InvalidSignature.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let trace_id = response
            .headers()
            .get(TRACE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(trace_id.starts_with("err_"));
        assert_eq!(
            response.headers().get(ERROR_CODE_HEADER).unwrap(),
            "INVALID_SIGNATURE"
        );

        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        let payload: Value = serde_json::from_slice(&body).expect("parse response json");
        assert_eq!(payload["detail"]["code"], json!("INVALID_SIGNATURE"));
        assert_eq!(payload["detail"]["status"], json!(401));
        assert_eq!(payload["detail"]["trace_id"], json!(trace_id));
        assert!(payload["detail"]["timestamp"].as_f64().unwrap_or_default() > 0.0);
    }

    #[tokio::test]
    async fn storage_errors_hide_their_cause() {
        let response =
            BotError::Storage(anyhow::anyhow!("database is locked")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["detail"]["message"], json!("internal error"));
        assert_eq!(payload["detail"]["code"], json!("INTERNAL_ERROR"));
    }
}
