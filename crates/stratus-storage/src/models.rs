// Database row models (internal, converted to domain types at the edge)

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use stratus_core::{
    Job, JobLink, JobStatus, Result, ServiceError, StepOperation, TemporalRange, WorkItem,
    WorkItemStatus, WorkflowStep,
};

/// Job row from the jobs table. Labels are joined in separately.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub job_id: Uuid,
    pub username: String,
    pub status: String,
    pub progress: i32,
    pub message: String,
    pub request: String,
    pub num_input_granules: i32,
    pub ignore_errors: bool,
    pub is_synchronous: bool,
    pub destination_url: Option<String>,
    pub collection_ids: sqlx::types::JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub fn into_job(self, labels: Vec<String>) -> Result<Job> {
        Ok(Job {
            job_id: self.job_id,
            username: self.username,
            status: self.status.parse::<JobStatus>()?,
            progress: self.progress,
            message: self.message,
            request: self.request,
            num_input_granules: self.num_input_granules,
            ignore_errors: self.ignore_errors,
            is_synchronous: self.is_synchronous,
            labels,
            collection_ids: serde_json::from_value(self.collection_ids)
                .map_err(|e| ServiceError::server(format!("collection_ids decode: {e}")))?,
            destination_url: self.destination_url,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowStepRow {
    pub job_id: Uuid,
    pub step_index: i32,
    pub service_image: String,
    pub operation: sqlx::types::JsonValue,
    pub work_item_count: i32,
    pub completed_item_count: i32,
    pub failed_item_count: i32,
    pub progress_weight: f64,
    pub is_sequential: bool,
    pub has_aggregated_output: bool,
    pub operations: sqlx::types::JsonValue,
}

impl WorkflowStepRow {
    pub fn into_step(self) -> Result<WorkflowStep> {
        let operations: Vec<StepOperation> = serde_json::from_value(self.operations)
            .map_err(|e| ServiceError::server(format!("step operations decode: {e}")))?;
        Ok(WorkflowStep {
            job_id: self.job_id,
            step_index: self.step_index,
            service_image: self.service_image,
            operation: self.operation,
            work_item_count: self.work_item_count,
            completed_item_count: self.completed_item_count,
            failed_item_count: self.failed_item_count,
            progress_weight: self.progress_weight,
            is_sequential: self.is_sequential,
            has_aggregated_output: self.has_aggregated_output,
            operations,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkItemRow {
    pub id: i64,
    pub job_id: Uuid,
    pub step_index: i32,
    pub service_image: String,
    pub status: String,
    pub retry_count: i32,
    pub stac_catalog_location: String,
    pub result_uris: sqlx::types::JsonValue,
    pub output_item_sizes: sqlx::types::JsonValue,
    pub sort_index: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub leased_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItemRow {
    pub fn into_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: self.id,
            job_id: self.job_id,
            step_index: self.step_index,
            service_image: self.service_image,
            status: self.status.parse::<WorkItemStatus>()?,
            retry_count: self.retry_count,
            stac_catalog_location: self.stac_catalog_location,
            result_uris: serde_json::from_value(self.result_uris)
                .map_err(|e| ServiceError::server(format!("result_uris decode: {e}")))?,
            output_item_sizes: serde_json::from_value(self.output_item_sizes)
                .map_err(|e| ServiceError::server(format!("output_item_sizes decode: {e}")))?,
            sort_index: self.sort_index,
            started_at: self.started_at,
            leased_until: self.leased_until,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct JobLinkRow {
    pub href: String,
    pub rel: String,
    pub mime_type: Option<String>,
    pub title: Option<String>,
    pub bbox: Option<sqlx::types::JsonValue>,
    pub temporal: Option<sqlx::types::JsonValue>,
}

impl JobLinkRow {
    pub fn into_link(self) -> Result<JobLink> {
        let bbox: Option<[f64; 4]> = match self.bbox {
            Some(v) => serde_json::from_value(v)
                .map_err(|e| ServiceError::server(format!("bbox decode: {e}")))?,
            None => None,
        };
        let temporal: Option<TemporalRange> = match self.temporal {
            Some(v) => serde_json::from_value(v)
                .map_err(|e| ServiceError::server(format!("temporal decode: {e}")))?,
            None => None,
        };
        Ok(JobLink {
            href: self.href,
            rel: self.rel,
            mime_type: self.mime_type,
            title: self.title,
            bbox,
            temporal,
        })
    }
}
