//! The unified error envelope.
//!
//! Every non-2xx response is `{"error": {"message", "details"?}}`. Stack
//! traces and internal paths never reach the client; permanent faults log
//! the detail server-side and return a generic message with the request id
//! in the response headers for correlation.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use vg_pipeline::{FieldError, IngestError, ValidationFailure};
use vg_store::StoreError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    /// Payload shape or bounds violation; carries per-field reasons.
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    /// Missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated but the role does not permit the operation.
    #[error("forbidden")]
    Forbidden,

    /// Absent resource, or a resource outside the caller's tenant; the two
    /// are deliberately indistinguishable.
    #[error("not found")]
    NotFound,

    /// Rate or size quota exhausted.
    #[error("too many requests")]
    Quota { retry_after_secs: u64 },

    /// Transient persistence fault on a dashboard path; retryable.
    #[error("temporarily unavailable")]
    Transient,

    /// Anything else. The detail is logged, never returned.
    #[error("internal error")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            ApiError::Transient
        } else {
            ApiError::Internal(err.to_string())
        }
    }
}

impl From<ValidationFailure> for ApiError {
    fn from(err: ValidationFailure) -> Self {
        ApiError::Validation(err.errors)
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Invalid(failure) => failure.into(),
            IngestError::Store(store) => store.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// IntoResponse implementation
// ---------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(details) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "error": { "message": "validation failed", "details": details }
                })),
            )
                .into_response(),

            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": { "message": "unauthorized" } })),
            )
                .into_response(),

            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": { "message": "forbidden" } })),
            )
                .into_response(),

            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": { "message": "not found" } })),
            )
                .into_response(),

            ApiError::Quota { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_secs.to_string())],
                Json(json!({
                    "error": {
                        "message": "rate limit exceeded",
                        "details": { "retryAfter": retry_after_secs }
                    }
                })),
            )
                .into_response(),

            ApiError::Transient => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": { "message": "temporarily unavailable", "details": { "retryable": true } }
                })),
            )
                .into_response(),

            ApiError::Internal(detail) => {
                error!(detail, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": { "message": "internal error" } })),
                )
                    .into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
