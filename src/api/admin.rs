// Operator diagnostics over the pipeline tables, plus a manual enqueue
// escape hatch for re-driving a missed video.
use crate::api::errors::error_response;
use crate::services::now_ts;
use crate::state::AppState;
use crate::storage::{WebhookEventRecord, SOURCE_MANUAL};
use anyhow::anyhow;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/admin/summary", get(summary))
        .route("/api/admin/quota", get(quota_usage))
        .route("/api/admin/failed-jobs", get(failed_jobs))
        .route("/api/admin/unprocessed", get(unprocessed_events))
        .route("/api/admin/events", post(enqueue_manual_event))
}

#[derive(Debug, Deserialize)]
struct DaysQuery {
    #[serde(default)]
    days: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct HoursQuery {
    #[serde(default)]
    hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ManualEventRequest {
    channel_id: String,
    video_id: String,
    #[serde(default)]
    title: Option<String>,
}

async fn summary(State(state): State<Arc<AppState>>) -> Response {
    let storage = state.storage.clone();
    let now = now_ts();
    let result = tokio::task::spawn_blocking(move || storage.pipeline_summary(now))
        .await
        .unwrap_or_else(|err| Err(anyhow!(err.to_string())));
    match result {
        Ok(summary) => Json(json!({ "data": {
            "active_subscriptions": summary.active_subscriptions,
            "websub_active": summary.websub_active,
            "failed_jobs_24h": summary.failed_jobs_24h,
            "unprocessed_events_24h": summary.unprocessed_events_24h,
            "processed_7d": summary.processed_7d,
            "success_rate_7d": summary.success_rate_7d,
            "events_received_24h": summary.events_received_24h,
        }}))
        .into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn quota_usage(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DaysQuery>,
) -> Response {
    let days = query.days.unwrap_or(7).clamp(1, 90);
    let storage = state.storage.clone();
    let result = tokio::task::spawn_blocking(move || storage.list_quota_usage(days))
        .await
        .unwrap_or_else(|err| Err(anyhow!(err.to_string())));
    match result {
        Ok(rows) => {
            let items: Vec<Value> = rows
                .iter()
                .map(|row| {
                    json!({
                        "date": row.usage_date,
                        "service": row.service,
                        "requests_used": row.requests_used,
                        "quota_limit": row.quota_limit,
                        "cost_units_used": row.cost_units_used,
                        "cost_unit_limit": row.cost_unit_limit,
                        "last_updated": row.last_updated,
                    })
                })
                .collect();
            Json(json!({ "data": items })).into_response()
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn failed_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DaysQuery>,
) -> Response {
    let days = query.days.unwrap_or(7).clamp(1, 90);
    let since = now_ts() - days as f64 * 86_400.0;
    let storage = state.storage.clone();
    let result = tokio::task::spawn_blocking(move || storage.list_failed_jobs(since, 500))
        .await
        .unwrap_or_else(|err| Err(anyhow!(err.to_string())));
    match result {
        Ok(rows) => {
            let items: Vec<Value> = rows
                .iter()
                .map(|row| {
                    json!({
                        "user_id": row.user_id,
                        "video_id": row.video_id,
                        "channel_id": row.channel_id,
                        "title": row.title,
                        "processed_at": row.processed_at,
                        "error_message": row.error_message,
                        "retry_count": row.retry_count,
                        "source": row.source,
                    })
                })
                .collect();
            Json(json!({ "data": items })).into_response()
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn unprocessed_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HoursQuery>,
) -> Response {
    let hours = query.hours.unwrap_or(24).clamp(1, 24 * 30);
    let since = now_ts() - hours as f64 * 3600.0;
    let storage = state.storage.clone();
    let result = tokio::task::spawn_blocking(move || storage.list_unprocessed_since(since))
        .await
        .unwrap_or_else(|err| Err(anyhow!(err.to_string())));
    match result {
        Ok(rows) => {
            let items: Vec<Value> = rows
                .iter()
                .map(|row| {
                    json!({
                        "event_id": row.event_id,
                        "channel_id": row.channel_id,
                        "video_id": row.video_id,
                        "title": row.title,
                        "source": row.source,
                        "received_at": row.received_at,
                    })
                })
                .collect();
            Json(json!({ "data": items })).into_response()
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn enqueue_manual_event(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ManualEventRequest>,
) -> Response {
    let channel_id = payload.channel_id.trim().to_string();
    let video_id = payload.video_id.trim().to_string();
    if channel_id.is_empty() || video_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "channel_id and video_id required");
    }
    let title = payload
        .title
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let record = WebhookEventRecord::new(
        &channel_id,
        &video_id,
        title,
        SOURCE_MANUAL,
        json!({ "enqueued_by": "operator" }).to_string(),
        now_ts(),
    );
    let event_id = record.event_id.clone();
    let storage = state.storage.clone();
    let result = tokio::task::spawn_blocking(move || storage.insert_webhook_event(&record))
        .await
        .unwrap_or_else(|err| Err(anyhow!(err.to_string())));
    match result {
        Ok(()) => Json(json!({ "data": { "event_id": event_id } })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}
