// Error kinds carried through the orchestrator core
//
// Each variant maps to exactly one HTTP status at the API boundary;
// the mapping lives in stratus-api.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors that can occur inside the orchestrator core
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed input or a referenced value failed validation (HTTP 400)
    #[error("invalid request: {0}")]
    RequestValidation(String),

    /// Referenced entity does not exist (HTTP 404)
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller may not act on the job (HTTP 403)
    #[error("forbidden: {0}")]
    Authorization(String),

    /// Operation incompatible with current state (HTTP 409)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Metadata catalog returned a server error (HTTP 503)
    #[error("upstream catalog unavailable: {0}")]
    UpstreamUnavailable(String),

    /// No configured service supports the requested transformation (HTTP 422)
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Database or object store failed; the transaction was rolled back (HTTP 500)
    #[error("server error: {0}")]
    Server(String),
}

impl ServiceError {
    /// Create a request validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        ServiceError::RequestValidation(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        ServiceError::Conflict(msg.into())
    }

    /// Create a server error
    pub fn server(msg: impl Into<String>) -> Self {
        ServiceError::Server(msg.into())
    }

    /// Create a not-found error for a job
    pub fn job_not_found(job_id: Uuid) -> Self {
        ServiceError::NotFound(format!("job {job_id}"))
    }

    /// Create a not-found error for a work item
    pub fn item_not_found(id: i64) -> Self {
        ServiceError::NotFound(format!("work item {id}"))
    }

    /// True when the caller should treat the failure as transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::Server(_) | ServiceError::UpstreamUnavailable(_)
        )
    }
}
