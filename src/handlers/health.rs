use axum::{Json, extract::State, response::IntoResponse};

use crate::state::AppState;

// Public liveness check, never gated
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let healthy_backends = state
        .load_balancer
        .all_backends()
        .iter()
        .filter(|b| b.is_healthy())
        .count();

    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "healthyBackends": healthy_backends,
        "trackedClients": state.gate.rate_limiter.tracked_clients(),
    }))
}
