//! Job submission, inspection and administrative actions.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hydromaas_id::JobId;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::jobs::{ActionReason, Job, JobActionResponse, JobExecPhase, JobExecStep, JobRequest};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/{job_id}", get(get_job).delete(delete_job))
        .route("/{job_id}/status", get(get_job_status))
        .route("/{job_id}/stop", post(stop_job))
        .route("/{job_id}/restart", post(restart_job))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub items: Vec<Job>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub phase: JobExecPhase,
    pub step: JobExecStep,
    /// `PHASE:STEP`.
    pub status: String,
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    JobId::parse(raw)
        .map_err(|e| ApiError::bad_request("invalid_job_id", format!("Invalid job ID: {e}")))
}

/// The action outcome is always the body; the reason picks the status code.
fn action_response(response: JobActionResponse) -> Response {
    let status = match response.reason {
        ActionReason::Success => StatusCode::OK,
        ActionReason::NotFound => StatusCode::NOT_FOUND,
        ActionReason::InvalidState | ActionReason::NotEligible => StatusCode::CONFLICT,
        ActionReason::StoreFailure => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(response)).into_response()
}

async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.manager().create_job(request).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Active jobs.
async fn list_jobs(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let items = state.manager().get_active_jobs().await?;
    Ok(Json(ListJobsResponse { items }))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    match state.manager().get_job(job_id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(ApiError::not_found(
            "job_not_found",
            format!("Job {job_id} not found"),
        )),
    }
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    match state.manager().get_job_status(job_id).await? {
        Some(status) => Ok(Json(JobStatusResponse {
            job_id,
            phase: status.phase(),
            step: status.step(),
            status: status.to_string(),
        })),
        None => Err(ApiError::not_found(
            "job_not_found",
            format!("Job {job_id} not found"),
        )),
    }
}

async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(action_response(state.manager().delete_job(job_id).await))
}

async fn stop_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(action_response(state.manager().request_stop(job_id).await))
}

async fn restart_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(action_response(state.manager().request_restart(job_id).await))
}
