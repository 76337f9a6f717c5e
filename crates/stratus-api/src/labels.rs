// Label management routes

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::put;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, ErrorBody};
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct LabelsRequest {
    #[serde(rename = "jobID")]
    pub job_ids: Vec<Uuid>,
    #[serde(rename = "label")]
    pub labels: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LabelsResponse {
    /// Labels as stored: lowercased, trimmed, sorted, deduplicated
    pub labels: Vec<String>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/labels", put(add_labels).delete(remove_labels))
        .with_state(state)
}

/// PUT /labels - add labels to jobs
#[utoipa::path(
    put,
    path = "/labels",
    request_body = LabelsRequest,
    responses(
        (status = 201, description = "Labels added", body = LabelsResponse),
        (status = 400, description = "No labels provided", body = ErrorBody),
        (status = 404, description = "Unknown job", body = ErrorBody)
    ),
    tag = "labels"
)]
pub async fn add_labels(
    State(state): State<AppState>,
    Json(req): Json<LabelsRequest>,
) -> Result<(StatusCode, Json<LabelsResponse>), ApiError> {
    let labels = state.engine.add_labels(&req.job_ids, req.labels).await?;
    Ok((StatusCode::CREATED, Json(LabelsResponse { labels })))
}

/// DELETE /labels - remove labels from jobs
#[utoipa::path(
    delete,
    path = "/labels",
    request_body = LabelsRequest,
    responses(
        (status = 204, description = "Labels removed"),
        (status = 404, description = "Unknown job", body = ErrorBody)
    ),
    tag = "labels"
)]
pub async fn remove_labels(
    State(state): State<AppState>,
    Json(req): Json<LabelsRequest>,
) -> Result<StatusCode, ApiError> {
    state.engine.remove_labels(&req.job_ids, req.labels).await?;
    Ok(StatusCode::NO_CONTENT)
}
