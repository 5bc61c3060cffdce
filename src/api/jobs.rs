//! Background job endpoints: submit, inspect, list and cancel.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;
use uuid::Uuid;

use super::routes::AppState;
use super::types::{JobListQuery, SubmitJobRequest, SubmitJobResponse};
use crate::jobs::{Job, JobStatusFilter, JobType, OrchestratorError};

fn error_response(e: OrchestratorError) -> (StatusCode, String) {
    let status = match &e {
        OrchestratorError::UnknownJob(_) => StatusCode::NOT_FOUND,
        OrchestratorError::NotCancellable { .. } => StatusCode::CONFLICT,
        OrchestratorError::NoExecutor(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, e.to_string())
}

pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<Json<SubmitJobResponse>, (StatusCode, String)> {
    let job = state
        .orchestrator
        .submit(request.job_type, request.params, request.owner_session_id)
        .await
        .map_err(error_response)?;
    Ok(Json(SubmitJobResponse {
        id: job.id,
        status: job.status,
    }))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, (StatusCode, String)> {
    state
        .orchestrator
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("job {} not found", id)))
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<Vec<Job>>, (StatusCode, String)> {
    let status = JobStatusFilter::parse(query.status.as_deref()).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            format!("unknown status filter: {}", query.status.unwrap_or_default()),
        )
    })?;
    let job_type = match query.job_type.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(JobType::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("unknown job type: {}", raw),
            )
        })?),
    };
    Ok(Json(state.orchestrator.list(status, job_type).await))
}

pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, (StatusCode, String)> {
    state
        .orchestrator
        .cancel(id)
        .await
        .map(Json)
        .map_err(error_response)
}
