// Module: http
// HTTP surface of the hub: WebSocket accept path plus health and stats

pub mod error;
pub mod health;
pub mod stats;
pub mod websocket;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use relayhub_cluster::{ConnectionLimits, Hub};

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub limits: ConnectionLimits,
}

impl AppState {
    #[must_use]
    pub const fn new(hub: Hub, limits: ConnectionLimits) -> Self {
        Self { hub, limits }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check endpoints
        .merge(health::create_health_router())
        .merge(stats::create_stats_router())
        .route("/ws", get(websocket::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
