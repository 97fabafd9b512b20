//! `POST /api/errors` and the per-event alert hook.
//!
//! Alert evaluation and dispatch run on a spawned task, never on the
//! request path: the client gets its 201 as soon as the write commits.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::{error, warn};

use vg_alerts::SnapshotBuilder;
use vg_core::types::Project;
use vg_pipeline::{FieldError, IngestReply, IngestedEvent, RawEvent};
use vg_telemetry::metrics::global_metrics;

use crate::api_error::ApiError;
use crate::auth::authenticate_api_key;
use crate::state::ApiState;

pub async fn ingest_error(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let project =
        authenticate_api_key(&state.store, &state.project_cache, &headers).await?;

    if body.len() > state.config.ingest.max_payload_bytes {
        return Err(ApiError::Validation(vec![FieldError {
            field: "body",
            message: format!(
                "payload exceeds {} bytes",
                state.config.ingest.max_payload_bytes
            ),
        }]));
    }
    let raw: RawEvent = serde_json::from_slice(&body).map_err(|e| {
        ApiError::Validation(vec![FieldError {
            field: "body",
            message: format!("invalid json: {e}"),
        }])
    })?;

    match state.pipeline.ingest(&project, raw, Utc::now()).await? {
        IngestReply::Created(event) => {
            global_metrics().increment_counter(
                "events_ingested_total",
                &[("environment", &event.environment)],
            );
            let response = (
                StatusCode::CREATED,
                Json(json!({
                    "errorId": event.error_id,
                    "fingerprint": event.fingerprint,
                    "count": event.count,
                })),
            )
                .into_response();

            tokio::spawn(evaluate_and_dispatch(state.clone(), project, event));
            Ok(response)
        }
        IngestReply::Dropped => {
            global_metrics().increment_counter("events_dropped_total", &[]);
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "accepted": true, "dropped": true })),
            )
                .into_response())
        }
    }
}

/// Evaluate every enabled rule of the project against the event and hand
/// triggered ones to the dispatcher. Runs detached from the request.
pub async fn evaluate_and_dispatch(
    state: Arc<ApiState>,
    project: Project,
    event: IngestedEvent,
) {
    let rules = match state.store.list_enabled_rules(project.id).await {
        Ok(rules) => rules,
        Err(err) => {
            error!(project_id = %project.id, error = %err, "failed to load alert rules");
            return;
        }
    };
    if rules.is_empty() {
        return;
    }

    let now = Utc::now();
    let mut builder = SnapshotBuilder::new(&state.store, &event, now);

    for rule in rules {
        let metrics = match builder.metrics_for(&rule).await {
            Ok(metrics) => metrics,
            Err(err) => {
                warn!(rule = %rule.id, error = %err, "metrics snapshot failed");
                continue;
            }
        };
        let evaluation = vg_alerts::evaluate(&rule, &event, &metrics);
        if !evaluation.triggered {
            continue;
        }
        global_metrics().increment_counter(
            "alerts_triggered_total",
            &[("rule_type", rule.conditions.type_name())],
        );
        match state
            .dispatcher
            .dispatch(&project, &rule, &event, &evaluation, now)
            .await
        {
            Ok(result) if result.suppressed_by_cooldown => {
                global_metrics().increment_counter("alerts_suppressed_total", &[]);
            }
            Ok(result) => {
                for channel in &result.channels {
                    let status = if channel.delivered { "ok" } else { "failed" };
                    global_metrics().increment_counter(
                        "notifications_total",
                        &[("channel", channel.kind.as_str()), ("status", status)],
                    );
                }
            }
            Err(err) => warn!(rule = %rule.id, error = %err, "dispatch failed"),
        }
    }
}
