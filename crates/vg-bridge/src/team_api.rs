//! Team member management and the performance aggregation.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use vg_core::types::{AlertPreferences, Role, TeamMember};

use crate::api_error::ApiError;
use crate::auth::authenticate_bearer;
use crate::state::ApiState;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMemberRequest {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub avatar_color: Option<String>,
    #[serde(default)]
    pub alert_preferences: Option<AlertPreferences>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMemberRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub active: Option<bool>,
    pub avatar_color: Option<String>,
    pub alert_preferences: Option<AlertPreferences>,
}

#[derive(Debug, Deserialize)]
pub struct PerformanceQuery {
    pub range: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn list_members(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    ctx.require(Role::Viewer)?;
    let members = state.store.list_members(ctx.project_id).await?;
    Ok(Json(members).into_response())
}

pub async fn create_member(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<CreateMemberRequest>,
) -> Result<Response, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    ctx.require(Role::Developer)?;

    let mut member = TeamMember::new(ctx.project_id, body.name, body.email);
    member.role = body.role;
    if let Some(color) = body.avatar_color {
        member.avatar_color = color;
    }
    if let Some(prefs) = body.alert_preferences {
        member.alert_preferences = prefs;
    }
    state.store.upsert_member(&member).await?;
    Ok((StatusCode::CREATED, Json(member)).into_response())
}

pub async fn update_member(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateMemberRequest>,
) -> Result<Response, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    ctx.require(Role::Developer)?;

    let mut member = state
        .store
        .get_member(ctx.project_id, id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if let Some(name) = body.name {
        member.name = name;
    }
    if let Some(email) = body.email {
        member.email = email;
    }
    if let Some(role) = body.role {
        member.role = Some(role);
    }
    if let Some(active) = body.active {
        member.active = active;
    }
    if let Some(color) = body.avatar_color {
        member.avatar_color = color;
    }
    if let Some(prefs) = body.alert_preferences {
        member.alert_preferences = prefs;
    }

    state.store.upsert_member(&member).await?;
    Ok(Json(member).into_response())
}

pub async fn delete_member(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    ctx.require(Role::Admin)?;

    if state.store.delete_member(ctx.project_id, id).await? {
        Ok(Json(json!({ "deleted": true })).into_response())
    } else {
        Err(ApiError::NotFound)
    }
}

pub async fn team_performance(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<PerformanceQuery>,
) -> Result<Response, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    ctx.require(Role::Viewer)?;

    let days = match query.range.as_deref() {
        Some("7d") | None => 7,
        Some("30d") => 30,
        Some("90d") => 90,
        Some(other) => {
            return Err(ApiError::Validation(vec![vg_pipeline::FieldError {
                field: "range",
                message: format!("unsupported range {other:?}; use 7d, 30d, or 90d"),
            }]))
        }
    };

    let since = Utc::now() - chrono::Duration::days(days);
    let rows = state.store.team_performance(ctx.project_id, since).await?;
    Ok(Json(json!({ "range": format!("{days}d"), "members": rows })).into_response())
}
