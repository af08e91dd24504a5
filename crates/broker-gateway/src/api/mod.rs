//! HTTP/WebSocket route table.

pub mod consumer_ws;
pub mod health;
pub mod introspect;
pub mod transport_hub;

use axum::routing::get;
use axum::Router;

use crate::auth::require_api_token;
use crate::state::AppState;

pub fn router(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/v1/sessions", get(introspect::list_sessions))
        .route("/v1/sessions/:session_key", get(introspect::get_session))
        .route("/v1/metrics", get(introspect::metrics))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_api_token,
        ));

    Router::new()
        .route("/healthz", get(health::health))
        .route("/readyz", get(health::readiness))
        .route("/v1/sessions/:session_key/ws", get(consumer_ws::consumer_ws))
        .route("/v1/sessions/:session_key/backend", get(transport_hub::backend_ws))
        .merge(protected)
}
