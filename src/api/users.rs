// Per-user surface: subscription bootstrap and channel opt-in toggles.
use crate::api::errors::error_response;
use crate::services::bootstrap::sync_user_subscriptions;
use crate::state::AppState;
use crate::storage::SubscriptionRecord;
use anyhow::anyhow;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/users/{user_id}/sync", post(sync_subscriptions))
        .route("/api/users/{user_id}/subscriptions", get(list_subscriptions))
        .route(
            "/api/users/{user_id}/subscriptions/{channel_id}",
            put(set_included),
        )
}

#[derive(Debug, Deserialize)]
struct IncludedRequest {
    included: bool,
}

async fn sync_subscriptions(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Response {
    let user_id = user_id.trim().to_string();
    if user_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "missing user id");
    }
    match sync_user_subscriptions(
        state.storage.clone(),
        state.vault.clone(),
        state.platform.clone(),
        state.websub.clone(),
        &user_id,
    )
    .await
    {
        Ok(outcome) => Json(json!({ "data": outcome })).into_response(),
        Err(err) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Response {
    let storage = state.storage.clone();
    let cleaned = user_id.trim().to_string();
    let result = tokio::task::spawn_blocking(move || storage.list_user_subscriptions(&cleaned))
        .await
        .unwrap_or_else(|err| Err(anyhow!(err.to_string())));
    match result {
        Ok(rows) => {
            let items: Vec<Value> = rows.iter().map(subscription_to_value).collect();
            Json(json!({ "data": items })).into_response()
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn set_included(
    State(state): State<Arc<AppState>>,
    Path((user_id, channel_id)): Path<(String, String)>,
    Json(payload): Json<IncludedRequest>,
) -> Response {
    let storage = state.storage.clone();
    let cleaned_user = user_id.trim().to_string();
    let cleaned_channel = channel_id.trim().to_string();
    let previous = {
        let storage = storage.clone();
        let user = cleaned_user.clone();
        let channel = cleaned_channel.clone();
        tokio::task::spawn_blocking(move || storage.get_subscription(&user, &channel))
            .await
            .unwrap_or_else(|err| Err(anyhow!(err.to_string())))
    };
    let previous = match previous {
        Ok(Some(record)) => record,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "subscription not found"),
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    let updated = {
        let storage = storage.clone();
        let user = cleaned_user.clone();
        let channel = cleaned_channel.clone();
        let included = payload.included;
        tokio::task::spawn_blocking(move || {
            storage.set_subscription_included(&user, &channel, included)
        })
        .await
        .unwrap_or_else(|err| Err(anyhow!(err.to_string())))
    };
    let updated = match updated {
        Ok(Some(record)) => record,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "subscription not found"),
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    // Opting out retires the push lease so the hub stops delivering.
    if !payload.included && previous.websub_subscribed {
        if let Err(err) = state.websub.retire(&previous).await {
            warn!(
                "lease retirement failed for channel {}: {err}",
                previous.channel_id
            );
        }
    }
    Json(json!({ "data": subscription_to_value(&updated) })).into_response()
}

fn subscription_to_value(record: &SubscriptionRecord) -> Value {
    json!({
        "channel_id": record.channel_id,
        "channel_title": record.channel_title,
        "included": record.included,
        "websub_subscribed": record.websub_subscribed,
        "lease_expires_at": record.lease_expires_at,
        "attempt_count": record.attempt_count,
        "polling_enabled": record.polling_enabled,
        "last_polled_at": record.last_polled_at,
        "created_at": record.created_at,
    })
}
