//! HTTP API
//!
//! The synchronous request/response surface. Each request leases a pooled
//! connection for its own duration only.

mod handlers;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bridge::BridgeManager;
use crate::registry::ConnectionRegistry;
use crate::session::SessionConfig;
use crate::sftp::TransferPipeline;

pub use types::{format_uptime, status_for, ApiError};

/// Application state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub manager: Arc<BridgeManager>,
    /// Command timeout defaults and clamp
    pub limits: SessionConfig,
    pub transfers: Arc<TransferPipeline>,
}

/// Create router with all routes
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/ssh/connect", post(handlers::connect))
        .route("/ssh/execute", post(handlers::execute))
        .route("/ssh/file/transfer", post(handlers::transfer))
        .route("/ssh/disconnect", post(handlers::disconnect))
        .route("/ssh/connections", get(handlers::connections))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires
pub async fn serve(
    state: AppState,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP API listening on http://{}", addr);
    }
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
