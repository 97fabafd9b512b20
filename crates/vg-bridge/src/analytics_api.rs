//! Read-only analytics aggregations over the pipeline's own counters.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use vg_core::types::Role;

use crate::api_error::ApiError;
use crate::auth::{authenticate_bearer, AuthContext};
use crate::state::ApiState;

async fn viewer(state: &ApiState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, headers).await?;
    ctx.require(Role::Viewer)?;
    Ok(ctx)
}

#[derive(Debug, Deserialize)]
pub struct TrendsQuery {
    pub days: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedQuery {
    pub error_id: Uuid,
}

pub async fn overview(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = viewer(&state, &headers).await?;
    let stats = state.store.analytics_overview(ctx.project_id).await?;
    Ok(Json(stats).into_response())
}

pub async fn trends(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<TrendsQuery>,
) -> Result<Response, ApiError> {
    let ctx = viewer(&state, &headers).await?;
    let days = query.days.unwrap_or(30).clamp(1, 365);
    let points = state.store.analytics_trends(ctx.project_id, days).await?;
    Ok(Json(points).into_response())
}

pub async fn top_errors(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Response, ApiError> {
    let ctx = viewer(&state, &headers).await?;
    let limit = query.limit.unwrap_or(10).clamp(1, 100);
    let top = state.store.analytics_top_errors(ctx.project_id, limit).await?;
    Ok(Json(top).into_response())
}

pub async fn patterns(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = viewer(&state, &headers).await?;
    let patterns = state.store.analytics_patterns(ctx.project_id).await?;
    Ok(Json(patterns).into_response())
}

pub async fn related_errors(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<RelatedQuery>,
) -> Result<Response, ApiError> {
    let ctx = viewer(&state, &headers).await?;
    let group = state
        .store
        .get_group(ctx.project_id, query.error_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let related = state
        .store
        .analytics_related_errors(ctx.project_id, &group, 5)
        .await?;
    Ok(Json(related).into_response())
}

pub async fn user_impact(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Response, ApiError> {
    let ctx = viewer(&state, &headers).await?;
    let limit = query.limit.unwrap_or(10).clamp(1, 100);
    let impact = state.store.analytics_user_impact(ctx.project_id, limit).await?;
    Ok(Json(impact).into_response())
}

pub async fn resolution(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = viewer(&state, &headers).await?;
    let stats = state.store.analytics_resolution(ctx.project_id).await?;
    Ok(Json(stats).into_response())
}
