use axum::{extract::State, routing::get, Json, Router};

use relayhub_cluster::HubStats;

use crate::http::AppState;

pub fn create_stats_router() -> Router<AppState> {
    Router::new().route("/stats", get(stats))
}

/// Current hub statistics
pub async fn stats(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats())
}
