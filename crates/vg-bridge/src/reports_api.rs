//! Report runs, share links, and schedules. Generation produces the
//! aggregate summary; rendering it to a document is an external concern.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use vg_core::types::{
    ReportCadence, ReportRun, ReportSchedule, Role, RunStatus, ScheduleStatus,
};

use crate::api_error::ApiError;
use crate::auth::{authenticate_bearer, AuthContext};
use crate::state::ApiState;

async fn developer(state: &ApiState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, headers).await?;
    ctx.require(Role::Developer)?;
    Ok(ctx)
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateReportRequest {
    #[serde(default = "default_window_days")]
    pub window_days: u32,
}

fn default_window_days() -> u32 {
    7
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduleRequest {
    pub name: String,
    pub cadence: ReportCadence,
    #[serde(default)]
    pub at_hour_utc: u32,
    #[serde(default)]
    pub weekday: Option<u32>,
    #[serde(default)]
    pub day_of_month: Option<u32>,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default)]
    pub recipients: Vec<String>,
}

fn default_format() -> String {
    "pdf".into()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateScheduleRequest {
    pub name: Option<String>,
    pub status: Option<ScheduleStatus>,
    pub at_hour_utc: Option<u32>,
    pub weekday: Option<u32>,
    pub day_of_month: Option<u32>,
    pub window_days: Option<u32>,
    pub recipients: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Run generation (shared with the scheduler via the store summary)
// ---------------------------------------------------------------------------

pub(crate) async fn produce_run(
    state: &ApiState,
    project_id: Uuid,
    schedule_id: Option<Uuid>,
    window_days: u32,
) -> Result<ReportRun, ApiError> {
    state
        .store
        .produce_report_run(project_id, schedule_id, window_days)
        .await
        .map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Run handlers
// ---------------------------------------------------------------------------

pub async fn generate_report(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<GenerateReportRequest>,
) -> Result<Response, ApiError> {
    let ctx = developer(&state, &headers).await?;
    let run = produce_run(&state, ctx.project_id, None, body.window_days.clamp(1, 365)).await?;
    Ok((StatusCode::CREATED, Json(run)).into_response())
}

pub async fn list_runs(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = developer(&state, &headers).await?;
    let runs = state.store.list_runs(ctx.project_id).await?;
    Ok(Json(runs).into_response())
}

pub async fn get_run(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = developer(&state, &headers).await?;
    let run = state
        .store
        .get_run(ctx.project_id, id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(run).into_response())
}

pub async fn download_run(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = developer(&state, &headers).await?;
    let run = state
        .store
        .get_run(ctx.project_id, id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if run.status != RunStatus::Success {
        return Err(ApiError::NotFound);
    }
    Ok((
        [(
            "content-disposition",
            format!("attachment; filename=\"report-{}.json\"", run.id),
        )],
        Json(run.summary),
    )
        .into_response())
}

pub async fn share_run(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = developer(&state, &headers).await?;
    let mut run = state
        .store
        .get_run(ctx.project_id, id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if run.status != RunStatus::Success {
        return Err(ApiError::NotFound);
    }

    run.share_token = Some(Uuid::new_v4().as_simple().to_string());
    run.share_expires_at = Some(Utc::now() + Duration::hours(state.config.reports.share_ttl_hours));
    state.store.upsert_run(&run).await?;

    Ok(Json(json!({
        "shareToken": run.share_token,
        "expiresAt": run.share_expires_at,
        "url": format!(
            "{}/api/reports/share/{}",
            state.config.reports.api_base_url.trim_end_matches('/'),
            run.share_token.as_deref().unwrap_or_default()
        ),
    }))
    .into_response())
}

/// Public, unauthenticated, time-boxed share link.
pub async fn shared_run(
    State(state): State<Arc<ApiState>>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let run = state
        .store
        .get_run_by_share_token(&token, Utc::now())
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(run.summary).into_response())
}

// ---------------------------------------------------------------------------
// Schedule handlers
// ---------------------------------------------------------------------------

pub async fn list_schedules(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = developer(&state, &headers).await?;
    let schedules = state.store.list_schedules(ctx.project_id).await?;
    Ok(Json(schedules).into_response())
}

pub async fn create_schedule(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<CreateScheduleRequest>,
) -> Result<Response, ApiError> {
    let ctx = developer(&state, &headers).await?;

    let mut schedule = ReportSchedule {
        id: Uuid::new_v4(),
        project_id: ctx.project_id,
        name: body.name,
        cadence: body.cadence,
        at_hour_utc: body.at_hour_utc.min(23),
        weekday: body.weekday.map(|d| d.clamp(1, 7)),
        day_of_month: body.day_of_month.map(|d| d.clamp(1, 31)),
        format: body.format,
        window_days: body.window_days.clamp(1, 365),
        recipients: body.recipients,
        status: ScheduleStatus::Active,
        next_run_at: None,
        last_run_at: None,
        last_claim_at: None,
        created_at: Utc::now(),
    };
    schedule.next_run_at = Some(schedule.next_run_after(Utc::now()));
    state.store.upsert_schedule(&schedule).await?;
    Ok((StatusCode::CREATED, Json(schedule)).into_response())
}

pub async fn update_schedule(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateScheduleRequest>,
) -> Result<Response, ApiError> {
    let ctx = developer(&state, &headers).await?;
    let mut schedule = state
        .store
        .get_schedule(ctx.project_id, id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if let Some(name) = body.name {
        schedule.name = name;
    }
    if let Some(status) = body.status {
        schedule.status = status;
    }
    if let Some(hour) = body.at_hour_utc {
        schedule.at_hour_utc = hour.min(23);
    }
    if let Some(weekday) = body.weekday {
        schedule.weekday = Some(weekday.clamp(1, 7));
    }
    if let Some(day) = body.day_of_month {
        schedule.day_of_month = Some(day.clamp(1, 31));
    }
    if let Some(window) = body.window_days {
        schedule.window_days = window.clamp(1, 365);
    }
    if let Some(recipients) = body.recipients {
        schedule.recipients = recipients;
    }

    // Timing fields changed; recompute when the next run fires.
    if schedule.status == ScheduleStatus::Active {
        schedule.next_run_at = Some(schedule.next_run_after(Utc::now()));
    } else {
        schedule.next_run_at = None;
    }
    state.store.upsert_schedule(&schedule).await?;
    Ok(Json(schedule).into_response())
}

pub async fn delete_schedule(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = authenticate_bearer(&state.store, &state.config.auth.jwt_secret, &headers).await?;
    ctx.require(Role::Admin)?;
    if state.store.delete_schedule(ctx.project_id, id).await? {
        Ok(Json(json!({ "deleted": true })).into_response())
    } else {
        Err(ApiError::NotFound)
    }
}

pub async fn run_schedule_now(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = developer(&state, &headers).await?;
    let schedule = state
        .store
        .get_schedule(ctx.project_id, id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let run = produce_run(
        &state,
        ctx.project_id,
        Some(schedule.id),
        schedule.window_days,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(run)).into_response())
}
