use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::Response;
use futures::FutureExt;
use std::any::Any as StdAny;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tubelater_server::api;
use tubelater_server::api::errors::error_response;
use tubelater_server::config::{load_config, Config};
use tubelater_server::shutdown::shutdown_with_token;
use tubelater_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    init_tracing(&config);
    let state = Arc::new(AppState::new(config.clone())?);

    let shutdown = CancellationToken::new();
    state.start_background(&shutdown);

    let app = api::build_router(state.clone())
        .layer(from_fn_with_state(state.clone(), admin_key_guard))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(panic_guard));

    let addr = bind_address(&config);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("ingestion service listening on http://{addr}");

    let server =
        axum::serve(listener, app).with_graceful_shutdown(shutdown_with_token(shutdown.clone()));
    if let Err(err) = server.await {
        warn!("server exited with error: {err}");
    }

    // Loops observe the token between units of work; give in-flight calls a
    // moment to land their final writes before the process goes away.
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn bind_address(config: &Config) -> String {
    let host = std::env::var("TUBELATER_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = std::env::var("TUBELATER_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}

async fn admin_key_guard(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if !request.uri().path().starts_with("/api/") {
        return Ok(next.run(request).await);
    }
    let Some(expected) = state.config.api_key() else {
        return Ok(next.run(request).await);
    };
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if provided != expected {
        return Ok(error_response(StatusCode::UNAUTHORIZED, "invalid api key"));
    }
    Ok(next.run(request).await)
}

async fn panic_guard(request: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let result = AssertUnwindSafe(next.run(request)).catch_unwind().await;
    match result {
        Ok(response) => Ok(response),
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!("panic while handling {method} {path}: {detail}");
            Ok(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error",
            ))
        }
    }
}

fn panic_message(panic: &(dyn StdAny + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
