// Hub-facing HTTP surface: lease verification GETs and Atom notification
// POSTs. Notification handling is synchronous with the response so a 5xx
// makes the hub redeliver.
use crate::api::errors::error_response;
use crate::atom::{parse_notification, verify_hub_signature};
use crate::services::now_ts;
use crate::state::AppState;
use crate::storage::{WebhookEventRecord, SOURCE_WEBHOOK};
use anyhow::anyhow;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const PLATFORM_HOST: &str = "youtube.com";
const SIGNATURE_HEADER: &str = "x-hub-signature";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", get(verify_intent).post(receive_notification))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

/// Hub subscription handshake: echo the challenge for topics on the
/// platform host, reject everything else. No database writes here.
async fn verify_intent(Query(params): Query<HashMap<String, String>>) -> Response {
    let mode = params
        .get("hub.mode")
        .map(|value| value.trim())
        .filter(|value| !value.is_empty());
    let challenge = params
        .get("hub.challenge")
        .map(|value| value.trim())
        .filter(|value| !value.is_empty());
    let (Some(mode), Some(challenge)) = (mode, challenge) else {
        return error_response(StatusCode::BAD_REQUEST, "missing hub.mode or hub.challenge");
    };
    if let Some(topic) = params.get("hub.topic") {
        if !topic.contains(PLATFORM_HOST) {
            return error_response(StatusCode::BAD_REQUEST, "unexpected hub.topic");
        }
    }
    info!("hub verification accepted: mode={mode}");
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        challenge.to_string(),
    )
        .into_response()
}

async fn receive_notification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if body.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "empty notification body");
    }
    let notice = match parse_notification(&body) {
        Ok(notice) => notice,
        // 5xx on purpose: the hub retries at-least-once on server errors.
        Err(err) => {
            warn!("notification parse failed: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    };

    let secrets = {
        let storage = state.storage.clone();
        let channel_id = notice.channel_id.clone();
        match tokio::task::spawn_blocking(move || storage.list_channel_secrets(&channel_id))
            .await
            .unwrap_or_else(|err| Err(anyhow!(err.to_string())))
        {
            Ok(secrets) => secrets,
            Err(err) => {
                warn!("secret lookup failed: {err}");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
            }
        }
    };
    if !secrets.is_empty() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let verified = secrets
            .iter()
            .any(|secret| verify_hub_signature(secret, body.as_bytes(), signature));
        if !verified {
            warn!(
                "notification signature rejected for channel {}",
                notice.channel_id
            );
            return error_response(StatusCode::BAD_REQUEST, "signature verification failed");
        }
    }

    let record = WebhookEventRecord::new(
        &notice.channel_id,
        &notice.video_id,
        notice.title.clone(),
        SOURCE_WEBHOOK,
        body,
        now_ts(),
    );
    let result = {
        let storage = state.storage.clone();
        tokio::task::spawn_blocking(move || storage.insert_webhook_event(&record))
            .await
            .unwrap_or_else(|err| Err(anyhow!(err.to_string())))
    };
    match result {
        Ok(()) => {
            info!(
                "queued upload notice: channel={}, video={}",
                notice.channel_id, notice.video_id
            );
            StatusCode::OK.into_response()
        }
        Err(err) => {
            warn!("notification enqueue failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}
