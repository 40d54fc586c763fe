// Exit-signal handling shared by the HTTP server and the background loops.
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            eprintln!("failed to listen for ctrl-c: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut stream = signal(SignalKind::terminate()).expect("register SIGTERM listener");
        stream.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

/// Cancels the returned token once a shutdown signal arrives, then resolves.
/// Loops check the token between ticks and between per-row units of work.
pub async fn shutdown_with_token(token: CancellationToken) {
    shutdown_signal().await;
    token.cancel();
}
