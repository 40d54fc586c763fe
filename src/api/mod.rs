// Route assembly, split by domain.
pub mod admin;
pub mod errors;
pub mod users;
pub mod webhook;

use crate::state::AppState;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .merge(webhook::router())
        .merge(users::router())
        .merge(admin::router())
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
