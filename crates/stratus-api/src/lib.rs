// Stratus orchestrator HTTP surface
//
// Worker-facing routes (poll for work, report results) and control-plane
// routes (pause/resume/cancel/skip-preview, labels). The request-ingest
// layer that creates jobs lives upstream and drives the planner directly.

pub mod error;
pub mod jobs;
pub mod labels;
pub mod work;

use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use stratus_engine::{Dispatcher, ProgressEngine};

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Arc<ProgressEngine>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        work::get_work,
        work::update_work,
        jobs::pause_jobs,
        jobs::resume_jobs,
        jobs::cancel_jobs,
        jobs::skip_preview_jobs,
        labels::add_labels,
        labels::remove_labels,
    ),
    components(
        schemas(
            error::ErrorBody,
            work::WorkItemReport,
            jobs::JobListRequest,
            jobs::JobStateResponse,
            labels::LabelsRequest,
            labels::LabelsResponse,
            stratus_engine::WorkAssignment,
            stratus_core::WorkItem,
            stratus_core::WorkItemStatus,
            stratus_core::JobStatus,
        )
    ),
    tags(
        (name = "work", description = "Worker-facing dispatch endpoints"),
        (name = "jobs", description = "Job lifecycle control endpoints"),
        (name = "labels", description = "Job label endpoints")
    ),
    info(
        title = "Stratus Orchestrator API",
        version = "0.3.0",
        description = "Worker dispatch and job control for the Stratus data-transformation orchestrator",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

/// Assemble the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(work::routes(state.clone()))
        .merge(jobs::routes(state.clone()))
        .merge(labels::routes(state))
        .merge(SwaggerUi::new("/api-docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
