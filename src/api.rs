//! HTTP endpoints besides the WebSocket upgrade

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

/// Response structure for the health probe
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub providers: Vec<String>,
}

/// Liveness probe.
///
/// GET /health
///
/// Returns 503 once shutdown has begun so load balancers stop routing new peers here.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let accepting = state.registry.is_accepting();
    let response = HealthResponse {
        status: if accepting { "ok" } else { "shutting_down" },
        connections: state.registry.count().await,
        providers: state.llm.available(),
    };
    let code = if accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
