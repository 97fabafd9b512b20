//! Deployment markers. The pipeline never mutates these; they feed alert
//! enrichment and analytics, and arrive from CI via this endpoint.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use vg_core::types::{Deployment, Role};

use crate::api_error::ApiError;
use crate::auth::authenticate_bearer;
use crate::state::ApiState;

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub label: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ListDeploymentsQuery {
    pub hours: Option<i64>,
}

pub async fn create_deployment(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<CreateDeploymentRequest>,
) -> Result<Response, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    ctx.require(Role::Developer)?;

    let deployment = Deployment {
        id: Uuid::new_v4(),
        project_id: ctx.project_id,
        label: body.label,
        timestamp: body.timestamp.unwrap_or_else(Utc::now),
        metadata: body.metadata,
    };
    state.store.insert_deployment(&deployment).await?;
    Ok((StatusCode::CREATED, Json(deployment)).into_response())
}

pub async fn list_deployments(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<ListDeploymentsQuery>,
) -> Result<Response, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    ctx.require(Role::Viewer)?;

    let hours = query.hours.unwrap_or(24 * 7).clamp(1, 24 * 365);
    let now = Utc::now();
    let deployments = state
        .store
        .deployments_in_window(ctx.project_id, now - chrono::Duration::hours(hours), now, 100)
        .await?;
    Ok(Json(deployments).into_response())
}
