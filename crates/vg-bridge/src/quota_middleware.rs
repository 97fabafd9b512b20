//! Request quota enforcement.
//!
//! Requests carrying `X-Api-Key` are counted against the hash of that key
//! (so dashboards and ingest SDKs share nothing); requests without one fall
//! back to a per-client-IP counter with the same limits. Health endpoints
//! are exempt so probes cannot be rate-limited into red status.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use vg_core::keys;

use crate::api_error::ApiError;
use crate::auth::API_KEY_HEADER;
use crate::state::ApiState;

pub async fn quota_middleware(
    State(state): State<Arc<ApiState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if path == "/health" || path.starts_with("/health/") {
        return next.run(request).await;
    }

    let quota_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(keys::hash_api_key)
        .unwrap_or_else(|| format!("ip:{}", client_ip(&request)));

    match state.quota.check(&quota_key) {
        Ok(()) => next.run(request).await,
        Err(err) => ApiError::Quota {
            retry_after_secs: err.retry_after_secs(),
        }
        .into_response(),
    }
}

/// Wall-clock budget per request; exceeding answers 504. In-flight store
/// writes either commit or roll back whole (every write is a single
/// transaction), so an abandoned request leaves no partial state.
pub async fn timeout_middleware(
    State(state): State<Arc<ApiState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let budget = std::time::Duration::from_secs(state.config.server.request_timeout_secs.max(1));
    match tokio::time::timeout(budget, next.run(request)).await {
        Ok(response) => response,
        Err(_) => (
            axum::http::StatusCode::GATEWAY_TIMEOUT,
            axum::Json(serde_json::json!({
                "error": { "message": "request timed out" }
            })),
        )
            .into_response(),
    }
}

fn client_ip(request: &Request<Body>) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .or_else(|| {
            request
                .headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
