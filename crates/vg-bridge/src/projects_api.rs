//! Project registry endpoints: creation, settings, key rotation, deletion.
//!
//! These authenticate by bearer token alone (no `X-Project-Id`), since
//! creation has no project context yet and the others address the project
//! by path. Membership is still checked per project, with 404 for foreign
//! ids.

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

use vg_core::keys;
use vg_core::types::{Membership, Project, ProjectStatus, Role, ScrubPolicy, User};

use crate::api_error::ApiError;
use crate::state::ApiState;

use crate::auth::authenticate_user;

fn role_in(user: &User, project_id: Uuid) -> Result<Role, ApiError> {
    user.role_in(project_id).ok_or(ApiError::NotFound)
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub status: Option<ProjectStatus>,
    pub scrub_policy: Option<ScrubPolicy>,
    pub retention_days: Option<u32>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn list_projects(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = authenticate_user(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    let mut projects = Vec::new();
    for membership in &user.memberships {
        if let Some(project) = state.store.get_project(membership.project_id).await? {
            projects.push(json!({
                "project": project,
                "role": membership.role,
            }));
        }
    }
    Ok(Json(projects).into_response())
}

/// Create a project; the caller becomes its admin. The plaintext API key
/// appears in this response and nowhere else, ever.
pub async fn create_project(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<CreateProjectRequest>,
) -> Result<Response, ApiError> {
    let mut user =
        authenticate_user(&state.store, &state.config.auth.jwt_secret, &headers).await?;

    let generated = keys::generate_api_key();
    let project = Project::new(body.name, generated.hash, generated.preview);
    state.store.upsert_project(&project).await?;

    user.memberships.push(Membership {
        project_id: project.id,
        role: Role::Admin,
    });
    state.store.upsert_user(&user).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "project": project,
            "apiKey": generated.plaintext,
        })),
    )
        .into_response())
}

pub async fn update_project(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateProjectRequest>,
) -> Result<Response, ApiError> {
    let user = authenticate_user(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    if !role_in(&user, id)?.allows(Role::Admin) {
        return Err(ApiError::Forbidden);
    }

    let mut project = state.store.get_project(id).await?.ok_or(ApiError::NotFound)?;
    let old_hash = project.api_key_hash.clone();

    if let Some(name) = body.name {
        project.name = name;
    }
    if let Some(status) = body.status {
        project.status = status;
    }
    if let Some(policy) = body.scrub_policy {
        project.scrub_policy = policy;
    }
    if let Some(days) = body.retention_days {
        project.retention_days = Project::clamp_retention(days);
    }
    state.store.upsert_project(&project).await?;

    // Disabling a project must also stop cached keys from authenticating.
    if project.status == ProjectStatus::Disabled {
        state.project_cache.invalidate(&old_hash);
    }
    Ok(Json(project).into_response())
}

/// Atomic in-place rotation: the old key stops working immediately.
pub async fn rotate_project_key(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let user = authenticate_user(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    if !role_in(&user, id)?.allows(Role::Admin) {
        return Err(ApiError::Forbidden);
    }

    let project = state.store.get_project(id).await?.ok_or(ApiError::NotFound)?;
    let generated = keys::generate_api_key();
    if !state
        .store
        .rotate_project_key(id, &generated.hash, &generated.preview)
        .await?
    {
        return Err(ApiError::NotFound);
    }
    state.project_cache.invalidate(&project.api_key_hash);

    Ok(Json(json!({
        "apiKey": generated.plaintext,
        "apiKeyPreview": generated.preview,
        "rotatedAt": Utc::now(),
    }))
    .into_response())
}

pub async fn delete_project(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let user = authenticate_user(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    if !role_in(&user, id)?.allows(Role::Admin) {
        return Err(ApiError::Forbidden);
    }

    let project = state.store.get_project(id).await?.ok_or(ApiError::NotFound)?;
    state.store.delete_project(id).await?;
    state.project_cache.invalidate(&project.api_key_hash);
    Ok(Json(json!({ "deleted": true })).into_response())
}
