//! Workflow steps
//!
//! Steps form a dense 1-based sequence per job. Each step tracks how many
//! work items it owns and how many have reached a terminal state, which
//! is enough to compute job progress and step completion without scanning
//! items.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{Result, ServiceError};

/// Data operations a service step may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum StepOperation {
    Concatenate,
    DimensionSubset,
    Extend,
    Reproject,
    ShapefileSubset,
    SpatialSubset,
    TemporalSubset,
    VariableSubset,
}

impl std::fmt::Display for StepOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Concatenate => "concatenate",
            Self::DimensionSubset => "dimensionSubset",
            Self::Extend => "extend",
            Self::Reproject => "reproject",
            Self::ShapefileSubset => "shapefileSubset",
            Self::SpatialSubset => "spatialSubset",
            Self::TemporalSubset => "temporalSubset",
            Self::VariableSubset => "variableSubset",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for StepOperation {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "concatenate" => Ok(Self::Concatenate),
            "dimensionSubset" => Ok(Self::DimensionSubset),
            "extend" => Ok(Self::Extend),
            "reproject" => Ok(Self::Reproject),
            "shapefileSubset" => Ok(Self::ShapefileSubset),
            "spatialSubset" => Ok(Self::SpatialSubset),
            "temporalSubset" => Ok(Self::TemporalSubset),
            "variableSubset" => Ok(Self::VariableSubset),
            other => Err(ServiceError::server(format!("unknown step operation: {other}"))),
        }
    }
}

/// One step of a job's workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub job_id: Uuid,
    /// 1-based position in the workflow
    pub step_index: i32,
    pub service_image: String,
    /// Opaque data-operation parameters handed to workers unchanged
    pub operation: serde_json::Value,
    pub work_item_count: i32,
    pub completed_item_count: i32,
    pub failed_item_count: i32,
    /// This step's share of overall job progress; weights sum to 1
    pub progress_weight: f64,
    pub is_sequential: bool,
    pub has_aggregated_output: bool,
    pub operations: Vec<StepOperation>,
}

impl WorkflowStep {
    /// A step is complete once every item it owns reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.completed_item_count + self.failed_item_count >= self.work_item_count
    }

    /// Fraction of this step's items that reached a terminal state.
    pub fn progress_fraction(&self) -> f64 {
        if self.work_item_count <= 0 {
            return 0.0;
        }
        let done = (self.completed_item_count + self.failed_item_count) as f64;
        (done / self.work_item_count as f64).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(total: i32, completed: i32, failed: i32) -> WorkflowStep {
        WorkflowStep {
            job_id: Uuid::now_v7(),
            step_index: 1,
            service_image: "svc/subsetter:1".to_string(),
            operation: json!({}),
            work_item_count: total,
            completed_item_count: completed,
            failed_item_count: failed,
            progress_weight: 1.0,
            is_sequential: false,
            has_aggregated_output: false,
            operations: vec![StepOperation::SpatialSubset],
        }
    }

    #[test]
    fn completion_counts_failed_items() {
        assert!(!step(4, 3, 0).is_complete());
        assert!(step(4, 3, 1).is_complete());
        assert!(step(4, 4, 0).is_complete());
    }

    #[test]
    fn progress_fraction_is_clamped() {
        assert_eq!(step(4, 2, 0).progress_fraction(), 0.5);
        assert_eq!(step(0, 0, 0).progress_fraction(), 0.0);
        assert_eq!(step(2, 3, 0).progress_fraction(), 1.0);
    }

    #[test]
    fn operations_serialize_camel_case() {
        let op = serde_json::to_string(&StepOperation::SpatialSubset).unwrap();
        assert_eq!(op, "\"spatialSubset\"");
    }
}
