//! Health check endpoints
//!
//! Liveness for orchestrators plus a trivial ping.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ping", get(ping))
}

/// 200 while the hub is running and its broker answers, 503 otherwise
pub async fn healthz(State(state): State<AppState>) -> Response {
    if state.hub.is_healthy().await {
        (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error" })),
        )
            .into_response()
    }
}

pub async fn ping() -> impl IntoResponse {
    Json(json!({ "message": "pong" }))
}
