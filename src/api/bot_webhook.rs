use crate::bots::IngestOutcome;
use crate::core::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bots/webhook/{token}", post(bot_webhook).get(bot_webhook))
        .route("/health", get(health))
}

async fn bot_webhook(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match state
        .ingestor
        .ingest(&token, &body, &headers, &query)
        .await
    {
        Ok(outcome) => outcome_response(outcome),
        Err(err) => err.into_response(),
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

fn outcome_response(outcome: IngestOutcome) -> Response {
    match outcome {
        IngestOutcome::ChallengeEcho(echo) => raw_body_response(echo),
        IngestOutcome::Acknowledged {
            body: Some(body), ..
        } => raw_body_response(body),
        IngestOutcome::Acknowledged {
            event_id,
            duplicate,
            body: None,
        } => Json(json!({
            "ok": true,
            "event_id": event_id,
            "duplicate": duplicate,
        }))
        .into_response(),
    }
}

/// 原样回显适配器给出的响应体；仅当内容是 JSON 对象或数组时标记为 JSON。
fn raw_body_response(body: String) -> Response {
    let structured = serde_json::from_str::<Value>(&body)
        .is_ok_and(|value| value.is_object() || value.is_array());
    let content_type = if structured {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };
    let mut response = (StatusCode::OK, body).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
