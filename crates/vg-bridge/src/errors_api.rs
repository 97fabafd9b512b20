//! Error-group dashboard endpoints: listing, detail, status and assignment
//! mutations, and deletion.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use vg_core::types::{GroupStatus, Role};
use vg_pipeline::FieldError;
use vg_store::{GroupFilter, GroupSort, StatusUpdate};

use crate::api_error::ApiError;
use crate::auth::authenticate_bearer;
use crate::state::ApiState;

const DETAIL_OCCURRENCES: u32 = 50;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListErrorsQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub environment: Option<String>,
    pub status: Option<GroupStatus>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub source_file: Option<String>,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: GroupStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAssignmentRequest {
    pub member_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn list_errors(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<ListErrorsQuery>,
) -> Result<Response, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    ctx.require(Role::Viewer)?;

    let filter = GroupFilter {
        environment: query.environment,
        status: query.status,
        start_date: query.start_date,
        end_date: query.end_date,
        source_file: query.source_file,
        search: query.search,
        sort_by: query
            .sort_by
            .as_deref()
            .map(GroupSort::parse)
            .unwrap_or_default(),
        ascending: query.sort_order.as_deref() == Some("asc"),
        page: query.page.unwrap_or(1),
        limit: query.limit.unwrap_or(20),
    };

    let page = state.store.list_groups(ctx.project_id, filter).await?;
    Ok(Json(json!({
        "items": page.items,
        "total": page.total,
        "page": page.page,
        "limit": page.limit,
    }))
    .into_response())
}

pub async fn get_error(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    ctx.require(Role::Viewer)?;

    let group = state
        .store
        .get_group(ctx.project_id, id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let occurrences = state
        .store
        .recent_occurrences(group.id, DETAIL_OCCURRENCES)
        .await?;
    let occurrences_total = state.store.count_occurrences_for_group(group.id).await?;

    Ok(Json(json!({
        "group": group,
        "occurrences": occurrences,
        "occurrencesTotal": occurrences_total,
    }))
    .into_response())
}

pub async fn update_error_status(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateStatusRequest>,
) -> Result<Response, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    ctx.require(Role::Developer)?;

    match state
        .store
        .update_group_status(ctx.project_id, id, body.status)
        .await?
    {
        StatusUpdate::NotFound => Err(ApiError::NotFound),
        StatusUpdate::Invalid { from } => Err(ApiError::Validation(vec![FieldError {
            field: "status",
            message: format!("transition from {from:?} not allowed"),
        }])),
        StatusUpdate::Updated(group) => Ok(Json(group).into_response()),
    }
}

pub async fn update_error_assignment(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateAssignmentRequest>,
) -> Result<Response, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    ctx.require(Role::Developer)?;

    // Assignee must be a member of this project.
    if let Some(member_id) = body.member_id {
        state
            .store
            .get_member(ctx.project_id, member_id)
            .await?
            .ok_or_else(|| {
                ApiError::Validation(vec![FieldError {
                    field: "memberId",
                    message: "not a member of this project".into(),
                }])
            })?;
    }

    let group = state
        .store
        .update_group_assignment(ctx.project_id, id, body.member_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(group).into_response())
}

pub async fn delete_error(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    ctx.require(Role::Admin)?;

    if state.store.delete_group(ctx.project_id, id).await? {
        Ok(Json(json!({ "deleted": true })).into_response())
    } else {
        Err(ApiError::NotFound)
    }
}
