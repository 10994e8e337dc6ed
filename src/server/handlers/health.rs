use crate::server::state::AppState;
use axum::{Json, extract::State};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub live_sessions: usize,
    pub live_viewers: usize,
    pub cache_entries: usize,
    pub uptime_seconds: u64,
}

/// Liveness check with a snapshot of the proxy's shared state
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        live_sessions: state.live.session_count(),
        live_viewers: state.live.viewer_count(),
        cache_entries: state.cache.len(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}
