// Worker-facing HTTP routes
//
// Workers identify themselves by service image, poll for a leased item,
// and report results when done.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use utoipa::ToSchema;

use stratus_core::{ServiceError, WorkItemStatus, WorkItemUpdate};
use stratus_engine::WorkAssignment;

use crate::error::{ApiError, ErrorBody};
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct WorkQuery {
    #[serde(rename = "serviceID")]
    pub service_id: String,
}

/// Body of a worker's result report
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemReport {
    pub status: WorkItemStatus,
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default)]
    pub output_item_sizes: Vec<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/work", get(get_work))
        .route("/work/:id", axum::routing::put(update_work))
        .with_state(state)
}

/// GET /work - lease the next work item for a service image
#[utoipa::path(
    get,
    path = "/work",
    params(("serviceID" = String, Query, description = "Service image the worker runs")),
    responses(
        (status = 200, description = "A leased work item", body = WorkAssignment),
        (status = 404, description = "No work available"),
        (status = 503, description = "Store unavailable", body = ErrorBody)
    ),
    tag = "work"
)]
pub async fn get_work(
    State(state): State<AppState>,
    Query(query): Query<WorkQuery>,
) -> Result<Json<WorkAssignment>, ApiError> {
    let assignment = state
        .dispatcher
        .next_work(&query.service_id)
        .await
        // Workers interpret a store failure as retryable.
        .map_err(|e| match e {
            ServiceError::Server(msg) => ServiceError::UpstreamUnavailable(msg),
            other => other,
        })?;

    match assignment {
        Some(assignment) => Ok(Json(assignment)),
        None => Err(ApiError(ServiceError::NotFound(format!(
            "no work for service {}",
            query.service_id
        )))),
    }
}

/// PUT /work/{id} - report the outcome of a leased work item
#[utoipa::path(
    put,
    path = "/work/{id}",
    params(("id" = i64, Path, description = "Work item id")),
    request_body = WorkItemReport,
    responses(
        (status = 204, description = "Report applied"),
        (status = 404, description = "Unknown work item", body = ErrorBody),
        (status = 409, description = "Item or job already terminal", body = ErrorBody)
    ),
    tag = "work"
)]
pub async fn update_work(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(report): Json<WorkItemReport>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .handle_work_report(WorkItemUpdate {
            id,
            status: report.status,
            results: report.results,
            output_item_sizes: report.output_item_sizes,
            error_message: report.error_message,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
