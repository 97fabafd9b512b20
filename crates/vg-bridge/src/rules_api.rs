//! Alert-rule CRUD and the dry-run test endpoint. All admin-gated.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use vg_alerts::SnapshotBuilder;
use vg_core::types::{AlertRule, ChannelSpec, FilterNode, Role, RuleConditions};
use vg_pipeline::IngestedEvent;

use crate::api_error::ApiError;
use crate::auth::{authenticate_bearer, AuthContext};
use crate::state::ApiState;

async fn admin(state: &ApiState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, headers).await?;
    ctx.require(Role::Admin)?;
    Ok(ctx)
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRuleRequest {
    pub name: String,
    #[serde(flatten)]
    pub conditions: RuleConditions,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cooldown")]
    pub cooldown_minutes: i64,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub filter: Option<FilterNode>,
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
}

fn default_enabled() -> bool {
    true
}
fn default_cooldown() -> i64 {
    30
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRuleRequest {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub cooldown_minutes: Option<i64>,
    pub environments: Option<Vec<String>>,
    pub filter: Option<FilterNode>,
    pub channels: Option<Vec<ChannelSpec>>,
    #[serde(flatten)]
    pub conditions: Option<RuleConditions>,
}

// ---------------------------------------------------------------------------
// CRUD handlers
// ---------------------------------------------------------------------------

pub async fn list_rules(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = admin(&state, &headers).await?;
    let rules = state.store.list_rules(ctx.project_id).await?;
    Ok(Json(rules).into_response())
}

pub async fn create_rule(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<CreateRuleRequest>,
) -> Result<Response, ApiError> {
    let ctx = admin(&state, &headers).await?;
    let rule = AlertRule {
        id: Uuid::new_v4(),
        project_id: ctx.project_id,
        name: body.name,
        enabled: body.enabled,
        cooldown_minutes: body.cooldown_minutes.max(0),
        conditions: body.conditions,
        environments: body.environments,
        filter: body.filter,
        channels: body.channels,
        last_error_message: None,
        created_at: Utc::now(),
    };
    state.store.upsert_rule(&rule).await?;
    Ok((StatusCode::CREATED, Json(rule)).into_response())
}

pub async fn get_rule(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = admin(&state, &headers).await?;
    let rule = state
        .store
        .get_rule(ctx.project_id, id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(rule).into_response())
}

pub async fn update_rule(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateRuleRequest>,
) -> Result<Response, ApiError> {
    let ctx = admin(&state, &headers).await?;
    let mut rule = state
        .store
        .get_rule(ctx.project_id, id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if let Some(name) = body.name {
        rule.name = name;
    }
    if let Some(enabled) = body.enabled {
        rule.enabled = enabled;
    }
    if let Some(cooldown) = body.cooldown_minutes {
        rule.cooldown_minutes = cooldown.max(0);
    }
    if let Some(environments) = body.environments {
        rule.environments = environments;
    }
    if let Some(filter) = body.filter {
        rule.filter = Some(filter);
    }
    if let Some(channels) = body.channels {
        rule.channels = channels;
    }
    if let Some(conditions) = body.conditions {
        rule.conditions = conditions;
    }

    state.store.upsert_rule(&rule).await?;
    Ok(Json(rule).into_response())
}

pub async fn delete_rule(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = admin(&state, &headers).await?;
    if state.store.delete_rule(ctx.project_id, id).await? {
        Ok(Json(json!({ "deleted": true })).into_response())
    } else {
        Err(ApiError::NotFound)
    }
}

// ---------------------------------------------------------------------------
// Rule test (preview, never send)
// ---------------------------------------------------------------------------

/// Dry-run a rule against the project's most recent group (or a synthetic
/// sample when the project has no data yet). Channels are previewed, not
/// sent, and no cooldown state is touched.
pub async fn test_rule(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = admin(&state, &headers).await?;
    let rule = state
        .store
        .get_rule(ctx.project_id, id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let project = state
        .store
        .get_project(ctx.project_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let event = sample_event(&state, ctx.project_id).await?;
    let mut builder = SnapshotBuilder::new(&state.store, &event, Utc::now());
    let metrics = builder.metrics_for(&rule).await?;
    let evaluation = vg_alerts::evaluate(&rule, &event, &metrics);

    let snapshot = state
        .dispatcher
        .snapshot(&project, &rule, &event, &evaluation)
        .await?;

    let channels: Vec<serde_json::Value> = rule
        .channels
        .iter()
        .map(|spec| {
            json!({
                "type": spec.kind,
                "target": spec.target,
                "preview": state.dispatcher.preview_channel(&snapshot, spec),
            })
        })
        .collect();

    Ok(Json(json!({
        "triggered": evaluation.triggered,
        "evaluation": evaluation,
        "alert": snapshot,
        "channels": channels,
    }))
    .into_response())
}

/// Most recent real group when one exists, otherwise a synthetic sample.
async fn sample_event(state: &ApiState, project_id: Uuid) -> Result<IngestedEvent, ApiError> {
    let page = state
        .store
        .list_groups(project_id, vg_store::GroupFilter {
            limit: 1,
            page: 1,
            ..vg_store::GroupFilter::default()
        })
        .await?;

    Ok(match page.items.into_iter().next() {
        Some(group) => IngestedEvent {
            project_id,
            error_id: group.id,
            fingerprint: group.fingerprint,
            environment: group.environment,
            severity: group.severity,
            timestamp: Utc::now(),
            is_new: false,
            count: group.count,
            message: group.message,
            user_segment: None,
            source_file: group.stack_trace.first().map(|f| f.file.clone()),
        },
        None => IngestedEvent {
            project_id,
            error_id: Uuid::new_v4(),
            fingerprint: "sample-fingerprint".into(),
            environment: "production".into(),
            severity: vg_core::types::Severity::Error,
            timestamp: Utc::now(),
            is_new: true,
            count: 1,
            message: "Sample error for rule testing".into(),
            user_segment: None,
            source_file: None,
        },
    })
}
