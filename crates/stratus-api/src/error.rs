// Error-to-HTTP mapping for the orchestrator API

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use stratus_core::ServiceError;

/// Error body returned by every endpoint
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub description: String,
}

/// Wrapper making core errors usable as axum responses
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::RequestValidation(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Authorization(_) => StatusCode::FORBIDDEN,
        ServiceError::Conflict(_) => StatusCode::CONFLICT,
        ServiceError::Unsupported(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ServiceError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn code_for(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "stratus.RequestValidationError",
        StatusCode::NOT_FOUND => "stratus.NotFoundError",
        StatusCode::FORBIDDEN => "stratus.ForbiddenError",
        StatusCode::CONFLICT => "stratus.ConflictError",
        StatusCode::UNPROCESSABLE_ENTITY => "stratus.UnsupportedOperationError",
        StatusCode::SERVICE_UNAVAILABLE => "stratus.ServiceUnavailableError",
        _ => "stratus.ServerError",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {}", self.0);
        }
        let body = ErrorBody {
            code: code_for(status).to_string(),
            description: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
