use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use uuid::Uuid;

use crate::metrics::global_metrics;

/// Header carrying the per-request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Generate a 32-hex-char request id.
pub fn generate_request_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Axum middleware that injects `x-request-id` and wraps the request in a
/// tracing span carrying it.
///
/// An incoming `x-request-id` header is reused; otherwise a fresh id is
/// generated. The response always carries the header so clients can quote
/// it when reporting a failure.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    if let Ok(value) = request_id.parse() {
        request.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let _guard = span.enter();

    let mut response = next.run(request).await;

    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Axum middleware recording per-request counters and durations.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    let m = global_metrics();
    m.increment_counter(
        "http_requests_total",
        &[("method", &method), ("path", &path), ("status", &status)],
    );
    m.record_duration("http_request_seconds", start.elapsed().as_secs_f64());

    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
