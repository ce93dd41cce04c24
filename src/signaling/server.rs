//! HTTP server assembly
//!
//! Builds the axum router and runs it with graceful shutdown. CORS allows
//! any origin: the player is embedded on third-party pages.

use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::cors::CorsLayer;
use webrtc::api::API;

use crate::broadcast::Peer;
use crate::constants::LISTEN_ADDR;
use crate::metrics::MetricsContext;
use crate::signaling::handlers;

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// WebRTC API, built once per process
    pub api: Arc<API>,

    /// Process-wide metrics registry
    pub metrics: Arc<MetricsContext>,

    /// Hand-off channel into the broadcast loop
    pub handoff: crossbeam_channel::Sender<Peer>,
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sdp", any(handlers::sdp))
        .route("/metrics", get(handlers::metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the router until the shutdown notification fires, then finish
/// in-flight requests. The caller enforces the hard grace deadline.
pub async fn serve(app: Router, shutdown: Arc<Notify>) -> std::io::Result<()> {
    let listener = TcpListener::bind(LISTEN_ADDR).await?;
    tracing::info!("listening on {}", LISTEN_ADDR);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await
}
