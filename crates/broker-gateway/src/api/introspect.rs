//! REST introspection endpoints (§4.9, §6): a thin read-only window onto
//! the registry and live sessions, gated behind the API token middleware.
//! Grounded on the teacher gateway's `api::sessions`/`api::runs` list/get
//! shape — summary list + detail-by-key, nothing mutating.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let records = state.sessions.list_records();
    let items: Vec<_> = records
        .iter()
        .map(|r| {
            let live = state.sessions.get(&r.session_key);
            json!({
                "session_key": r.session_key,
                "session_id": r.session_id,
                "created_at": r.created_at,
                "updated_at": r.updated_at,
                "adapter_name": r.adapter_name,
                "consumers": live.as_ref().map(|s| s.consumer_count()).unwrap_or(0),
                "lifecycle": live.as_ref().map(|s| format!("{:?}", s.lifecycle())),
                "has_backend": state.manager.has_connection(&r.session_key),
            })
        })
        .collect();
    Json(json!({ "sessions": items, "count": items.len() }))
}

pub async fn get_session(
    Path(session_key): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let Some(session) = state.sessions.get(&session_key) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )
            .into_response();
    };
    Json(json!({
        "session_id": session.session_id,
        "session_key": session.session_key,
        "lifecycle": format!("{:?}", session.lifecycle()),
        "state": session.state_snapshot(),
        "history_len": session.history_snapshot().len(),
        "consumers": session.consumer_count(),
        "participants": session.participant_ids(),
        "observers": session.observer_ids(),
        "pending_permissions": session.permissions.list_pending().len(),
        "queued_message": session.queue.peek().map(|q| q.text),
        "adapter": session.adapter_binding().map(|b| b.adapter_name),
        "has_backend_connection": state.manager.has_connection(&session_key),
    }))
    .into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let records = state.sessions.list_records();
    let mut total_consumers = 0usize;
    let mut total_pending_permissions = 0usize;
    let mut connected = 0usize;
    for r in &records {
        if let Some(session) = state.sessions.get(&r.session_key) {
            total_consumers += session.consumer_count();
            total_pending_permissions += session.permissions.list_pending().len();
        }
        if state.manager.has_connection(&r.session_key) {
            connected += 1;
        }
    }
    Json(json!({
        "sessions_total": records.len(),
        "sessions_with_backend": connected,
        "consumers_total": total_consumers,
        "pending_permissions_total": total_pending_permissions,
        "adapters": state.adapters.keys().collect::<Vec<_>>(),
    }))
}
