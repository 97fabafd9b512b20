//! Liveness and readiness probes, plus the process metrics view.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use vg_telemetry::metrics::global_metrics;

use crate::api_error::ApiError;
use crate::auth::authenticate_user;
use crate::state::ApiState;

pub async fn health(State(state): State<Arc<ApiState>>) -> Response {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": state.start_time.elapsed().as_secs(),
    }))
    .into_response()
}

pub async fn health_db(State(state): State<Arc<ApiState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": { "message": err.to_string() } })),
        )
            .into_response(),
    }
}

/// The "cache" here is the process-local project cache and quota state;
/// both live in this process, so reachable means healthy.
pub async fn health_cache(State(_state): State<Arc<ApiState>>) -> Response {
    Json(json!({ "status": "ok", "mode": "in-process" })).into_response()
}

/// Process metrics snapshot; any authenticated user may read it.
pub async fn metrics(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authenticate_user(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    Ok(Json(global_metrics().snapshot_json()).into_response())
}
