// Control-plane job routes: pause, resume, cancel, skip-preview

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use stratus_core::{Job, JobStatus};

use crate::error::{ApiError, ErrorBody};
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct JobListRequest {
    #[serde(rename = "jobIDs")]
    pub job_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobStateResponse {
    #[serde(rename = "jobID")]
    pub job_id: Uuid,
    pub status: JobStatus,
}

impl From<&Job> for JobStateResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
        }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/jobs/pause", post(pause_jobs))
        .route("/jobs/resume", post(resume_jobs))
        .route("/jobs/cancel", post(cancel_jobs))
        .route("/jobs/skip-preview", post(skip_preview_jobs))
        .with_state(state)
}

/// POST /jobs/pause - suspend dispatch for jobs
#[utoipa::path(
    post,
    path = "/jobs/pause",
    request_body = JobListRequest,
    responses(
        (status = 200, description = "Jobs paused", body = Vec<JobStateResponse>),
        (status = 404, description = "Unknown job", body = ErrorBody),
        (status = 409, description = "Job not pausable", body = ErrorBody)
    ),
    tag = "jobs"
)]
pub async fn pause_jobs(
    State(state): State<AppState>,
    Json(req): Json<JobListRequest>,
) -> Result<Json<Vec<JobStateResponse>>, ApiError> {
    let mut out = Vec::with_capacity(req.job_ids.len());
    for job_id in req.job_ids {
        let job = state.engine.pause_job(job_id).await?;
        out.push(JobStateResponse::from(&job));
    }
    Ok(Json(out))
}

/// POST /jobs/resume - re-enable dispatch for paused jobs
#[utoipa::path(
    post,
    path = "/jobs/resume",
    request_body = JobListRequest,
    responses(
        (status = 200, description = "Jobs resumed", body = Vec<JobStateResponse>),
        (status = 404, description = "Unknown job", body = ErrorBody),
        (status = 409, description = "Job not resumable", body = ErrorBody)
    ),
    tag = "jobs"
)]
pub async fn resume_jobs(
    State(state): State<AppState>,
    Json(req): Json<JobListRequest>,
) -> Result<Json<Vec<JobStateResponse>>, ApiError> {
    let mut out = Vec::with_capacity(req.job_ids.len());
    for job_id in req.job_ids {
        let job = state.engine.resume_job(job_id).await?;
        out.push(JobStateResponse::from(&job));
    }
    Ok(Json(out))
}

/// POST /jobs/cancel - cancel jobs and all their remaining items
#[utoipa::path(
    post,
    path = "/jobs/cancel",
    request_body = JobListRequest,
    responses(
        (status = 200, description = "Jobs canceled", body = Vec<JobStateResponse>),
        (status = 404, description = "Unknown job", body = ErrorBody),
        (status = 409, description = "Job already terminal", body = ErrorBody)
    ),
    tag = "jobs"
)]
pub async fn cancel_jobs(
    State(state): State<AppState>,
    Json(req): Json<JobListRequest>,
) -> Result<Json<Vec<JobStateResponse>>, ApiError> {
    let mut out = Vec::with_capacity(req.job_ids.len());
    for job_id in req.job_ids {
        let job = state
            .engine
            .cancel_job(job_id, Some("canceled by request".to_string()))
            .await?;
        out.push(JobStateResponse::from(&job));
    }
    Ok(Json(out))
}

/// POST /jobs/skip-preview - move previewing jobs straight to running
#[utoipa::path(
    post,
    path = "/jobs/skip-preview",
    request_body = JobListRequest,
    responses(
        (status = 200, description = "Previews skipped", body = Vec<JobStateResponse>),
        (status = 404, description = "Unknown job", body = ErrorBody),
        (status = 409, description = "Job not previewing", body = ErrorBody)
    ),
    tag = "jobs"
)]
pub async fn skip_preview_jobs(
    State(state): State<AppState>,
    Json(req): Json<JobListRequest>,
) -> Result<Json<Vec<JobStateResponse>>, ApiError> {
    let mut out = Vec::with_capacity(req.job_ids.len());
    for job_id in req.job_ids {
        let job = state.engine.skip_preview(job_id).await?;
        out.push(JobStateResponse::from(&job));
    }
    Ok(Json(out))
}
