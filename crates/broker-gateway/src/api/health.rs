//! Public health/readiness probes.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn readiness(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ready",
        "live_sessions": state.sessions.live_count(),
        "adapters": state.adapters.keys().collect::<Vec<_>>(),
    }))
}
