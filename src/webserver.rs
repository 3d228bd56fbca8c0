use anyhow::Context;
use axum::extract::State;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Ready once the initial Pod cache sync finished.
pub async fn readiness_probe(State(synced): State<watch::Receiver<bool>>) -> impl IntoResponse {
    if *synced.borrow() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app(synced: watch::Receiver<bool>) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .with_state(synced)
}

/// Binds the health probe port. Called before any watching starts so a taken port fails
/// startup.
pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind webserver to {}", addr))
}

pub async fn serve(
    listener: TcpListener,
    synced: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_app(synced);
    info!("Starting webserver on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}
