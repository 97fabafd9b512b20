use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use vg_core::config::{IngestConfig, OversizePolicy};
use vg_core::metadata::MetadataMap;
use vg_core::types::{Frame, Severity, UserContext};

/// The `POST /api/errors` body as received from instrumented clients.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stack_trace: Vec<Frame>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_context: Option<UserContext>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// One per-field reason inside a 422 response.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
#[error("payload validation failed: {} field(s)", errors.len())]
pub struct ValidationFailure {
    pub errors: Vec<FieldError>,
}

/// A payload that passed validation, with defaults applied.
#[derive(Debug, Clone)]
pub struct CheckedEvent {
    pub message: String,
    pub stack_trace: Vec<Frame>,
    pub environment: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub user_context: UserContext,
    pub metadata: MetadataMap,
    pub session_id: Option<String>,
}

const TRUNCATION_MARKER: &str = "...[TRUNCATED]";
const MAX_ENVIRONMENT_CHARS: usize = 100;
const MAX_SESSION_ID_CHARS: usize = 128;
const FUTURE_SKEW: i64 = 5;

/// Validate shape and bounds, returning every violation at once so clients
/// can fix their payload in one round trip.
pub fn validate(
    raw: RawEvent,
    cfg: &IngestConfig,
    now: DateTime<Utc>,
) -> Result<CheckedEvent, ValidationFailure> {
    let mut errors = Vec::new();

    let message = match raw.message {
        None => {
            errors.push(FieldError {
                field: "message",
                message: "required".into(),
            });
            String::new()
        }
        Some(m) if m.trim().is_empty() => {
            errors.push(FieldError {
                field: "message",
                message: "must not be empty".into(),
            });
            String::new()
        }
        Some(m) if m.len() > cfg.max_message_bytes => match cfg.oversize_message {
            OversizePolicy::Reject => {
                errors.push(FieldError {
                    field: "message",
                    message: format!("exceeds {} bytes", cfg.max_message_bytes),
                });
                String::new()
            }
            OversizePolicy::Truncate => truncate_to(&m, cfg.max_message_bytes),
        },
        Some(m) => m,
    };

    let environment = match raw.environment {
        None => {
            errors.push(FieldError {
                field: "environment",
                message: "required".into(),
            });
            String::new()
        }
        Some(e) if e.trim().is_empty() => {
            errors.push(FieldError {
                field: "environment",
                message: "must not be empty".into(),
            });
            String::new()
        }
        Some(e) if e.chars().count() > MAX_ENVIRONMENT_CHARS => {
            errors.push(FieldError {
                field: "environment",
                message: format!("exceeds {MAX_ENVIRONMENT_CHARS} characters"),
            });
            String::new()
        }
        Some(e) => e.trim().to_string(),
    };

    if raw.stack_trace.len() > cfg.max_frames {
        errors.push(FieldError {
            field: "stackTrace",
            message: format!("exceeds {} frames", cfg.max_frames),
        });
    }

    let metadata = match &raw.metadata {
        None => MetadataMap::default(),
        Some(value) => match MetadataMap::sanitize(value) {
            Ok(map) => map,
            Err(err) => {
                errors.push(FieldError {
                    field: "metadata",
                    message: err.to_string(),
                });
                MetadataMap::default()
            }
        },
    };

    if !errors.is_empty() {
        return Err(ValidationFailure { errors });
    }

    // Client clocks drift; anything implausibly in the future is recorded
    // at arrival time instead.
    let timestamp = match raw.timestamp {
        Some(t) if t <= now + Duration::minutes(FUTURE_SKEW) => t,
        _ => now,
    };

    let severity = raw
        .severity
        .as_deref()
        .map(Severity::parse_lenient)
        .unwrap_or_default();

    let session_id = raw
        .session_id
        .filter(|s| !s.is_empty())
        .map(|s| s.chars().take(MAX_SESSION_ID_CHARS).collect());

    Ok(CheckedEvent {
        message,
        stack_trace: raw.stack_trace,
        environment,
        severity,
        timestamp,
        user_context: raw.user_context.unwrap_or_default(),
        metadata,
        session_id,
    })
}

fn truncate_to(input: &str, limit: usize) -> String {
    let mut cut = limit.saturating_sub(TRUNCATION_MARKER.len());
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &input[..cut])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
