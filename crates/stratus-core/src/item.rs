//! Work items and the per-user work ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{Result, ServiceError};

/// Work item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Eligible for dispatch
    Ready,

    /// Handed to a worker, not yet acknowledged as started
    Queued,

    /// Leased to a worker
    Running,

    Successful,
    Failed,

    /// Finished with a non-fatal warning; outputs are usable
    Warning,

    Canceled,
}

impl WorkItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkItemStatus::Successful
                | WorkItemStatus::Failed
                | WorkItemStatus::Warning
                | WorkItemStatus::Canceled
        )
    }

    /// Warning counts as success: outputs propagate to the next step.
    pub fn is_successful(&self) -> bool {
        matches!(self, WorkItemStatus::Successful | WorkItemStatus::Warning)
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Warning => "warning",
            Self::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkItemStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ready" => Ok(Self::Ready),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "successful" => Ok(Self::Successful),
            "failed" => Ok(Self::Failed),
            "warning" => Ok(Self::Warning),
            "canceled" => Ok(Self::Canceled),
            other => Err(ServiceError::server(format!(
                "unknown work item status: {other}"
            ))),
        }
    }
}

/// One unit of work belonging to a (job, step)
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: i64,
    pub job_id: Uuid,
    pub step_index: i32,
    pub service_image: String,
    pub status: WorkItemStatus,
    pub retry_count: i32,
    /// Input catalog fragment for this item, set by whichever component
    /// emitted it (planner or progress engine)
    pub stac_catalog_location: String,
    /// Output catalog fragment URIs, set only on terminal completion
    pub result_uris: Vec<String>,
    pub output_item_sizes: Vec<i64>,
    /// Dispatch order within the step
    pub sort_index: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub leased_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal outcome a worker reports for an item
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemUpdate {
    pub id: i64,
    pub status: WorkItemStatus,
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default)]
    pub output_item_sizes: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Materialized (ready, running) counts per (owner, service image)
///
/// Derived from work items; mutated only inside store transactions so the
/// dispatcher can select without scanning the items table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserWork {
    pub username: String,
    pub service_image: String,
    pub ready_count: i32,
    pub running_count: i32,
    /// Epoch when this owner has never been served for this image
    pub last_worked_at: DateTime<Utc>,
}

impl UserWork {
    pub fn new(username: impl Into<String>, service_image: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            service_image: service_image.into(),
            ready_count: 0,
            running_count: 0,
            last_worked_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_is_terminal_and_successful() {
        assert!(WorkItemStatus::Warning.is_terminal());
        assert!(WorkItemStatus::Warning.is_successful());
        assert!(!WorkItemStatus::Failed.is_successful());
        assert!(!WorkItemStatus::Ready.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            WorkItemStatus::Ready,
            WorkItemStatus::Queued,
            WorkItemStatus::Running,
            WorkItemStatus::Successful,
            WorkItemStatus::Failed,
            WorkItemStatus::Warning,
            WorkItemStatus::Canceled,
        ] {
            let parsed: WorkItemStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
