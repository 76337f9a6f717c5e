//! Workflow planner
//!
//! Turns a validated request plus resolved catalog metadata into a job:
//! the step sequence, the granule budget with its advisory message, the
//! stored query payload, and the seed item of the catalog-query step.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use stratus_core::{
    normalize_labels, CollectionInfo, Config, Job, JobStatus, ObjectStore, Result,
    ServiceDefinition, ServiceError, TransformationRequest, WorkflowStep,
};
use stratus_storage::{JobPlan, Store};

/// Image of the catalog-query step that starts every workflow
pub const QUERY_CMR_IMAGE: &str = "stratus/query-cmr:latest";

/// Which bound capped the granule budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GranuleBound {
    Requested,
    MaxResults,
    Collection,
    Service,
    System,
}

pub struct WorkflowPlanner {
    store: Arc<dyn Store>,
    objects: Arc<dyn ObjectStore>,
    config: Config,
}

impl WorkflowPlanner {
    pub fn new(store: Arc<dyn Store>, objects: Arc<dyn ObjectStore>, config: Config) -> Self {
        Self {
            store,
            objects,
            config,
        }
    }

    /// Plan and persist a job for a validated request.
    ///
    /// Validation failures return an error without creating anything.
    #[instrument(skip_all, fields(username = %username))]
    pub async fn plan_job(
        &self,
        username: &str,
        request: TransformationRequest,
        service: ServiceDefinition,
        collections: Vec<CollectionInfo>,
    ) -> Result<Job> {
        if collections.is_empty() {
            return Err(ServiceError::validation("request resolves no collections"));
        }
        if service.steps.is_empty() {
            return Err(ServiceError::Unsupported(format!(
                "service {} declares no processing steps",
                service.name
            )));
        }
        if !service.steps_within_capabilities() {
            return Err(ServiceError::Unsupported(format!(
                "service {} declares steps outside its capabilities",
                service.name
            )));
        }

        let is_synchronous = request.targets_single_granule() && !service.force_async;

        let (num_input_granules, message) = if is_synchronous {
            (1, String::new())
        } else {
            self.granule_budget(&request, &service, &collections)?
        };
        if num_input_granules == 0 {
            return Err(ServiceError::validation(
                "no granules match the request constraints",
            ));
        }

        let job_id = Uuid::now_v7();
        let now = Utc::now();

        let status = if is_synchronous || num_input_granules > self.config.preview_threshold {
            JobStatus::Previewing
        } else {
            JobStatus::Running
        };

        let job = Job {
            job_id,
            username: username.to_string(),
            status,
            progress: 0,
            message,
            request: request.request.clone(),
            num_input_granules,
            ignore_errors: request.ignore_errors,
            is_synchronous,
            labels: normalize_labels(&request.labels),
            collection_ids: request.collection_ids.clone(),
            destination_url: request.destination_url.clone(),
            created_at: now,
            updated_at: now,
        };

        let steps = build_steps(&job, &request, &service)?;

        // The stored query payload is opaque to the orchestrator: the
        // catalog-query worker reads it back and runs the paged search.
        let query_payload = json!({
            "collections": request.collection_ids,
            "granule_ids": request.granule_ids,
            "granule_name": request.granule_name,
            "operation": request.operation,
            "page_size": self.config.cmr_max_page_size,
        });
        let first_item_location = self
            .objects
            .put_json(&format!("jobs/{job_id}/query0.json"), &query_payload)
            .await?;

        let job = self
            .store
            .create_job(JobPlan {
                job,
                steps,
                first_item_location,
            })
            .await?;

        info!(
            %job_id,
            username,
            granules = num_input_granules,
            synchronous = is_synchronous,
            status = %job.status,
            "planned job"
        );
        Ok(job)
    }

    /// Granule budget: min(requested, collection limit, service limit,
    /// system limit), plus an advisory message naming the binding limit.
    fn granule_budget(
        &self,
        request: &TransformationRequest,
        service: &ServiceDefinition,
        collections: &[CollectionInfo],
    ) -> Result<(i32, String)> {
        let hits: i32 = collections.iter().map(|c| c.granule_hits).sum();

        let mut budget = (hits, GranuleBound::Requested);
        let mut consider = |candidate: Option<i32>, bound: GranuleBound| {
            if let Some(candidate) = candidate {
                if candidate < budget.0 {
                    budget = (candidate, bound);
                }
            }
        };

        consider(request.max_results, GranuleBound::MaxResults);
        consider(
            collections.iter().filter_map(|c| c.granule_limit).min(),
            GranuleBound::Collection,
        );
        consider(service.granule_limit, GranuleBound::Service);
        consider(Some(self.config.max_granule_limit), GranuleBound::System);

        let (num, bound) = budget;
        let message = match bound {
            GranuleBound::Requested => String::new(),
            GranuleBound::MaxResults => format!(
                "CMR query identified {hits} granules, but the request has been limited to process only {num} because of the request's maxResults parameter"
            ),
            GranuleBound::Collection => format!(
                "CMR query identified {hits} granules, but the request has been limited to process only {num} because of a limit on the collection"
            ),
            GranuleBound::Service => format!(
                "CMR query identified {hits} granules, but the request has been limited to process only {num} because of a limit on the service"
            ),
            GranuleBound::System => format!(
                "CMR query identified {hits} granules, but the request has been limited to process only {num} because of the system limit"
            ),
        };
        Ok((num.max(0), message))
    }
}

/// Emit the workflow steps: the sequential catalog-query step first,
/// then the service's declared pipeline, with normalized weights.
fn build_steps(
    job: &Job,
    request: &TransformationRequest,
    service: &ServiceDefinition,
) -> Result<Vec<WorkflowStep>> {
    let total = service.steps.len() + 1;

    // Uniform default weights; services may override per step. Whatever
    // mixture results is normalized so the weights sum to 1.
    let uniform = 1.0 / total as f64;
    let mut weights: Vec<f64> = Vec::with_capacity(total);
    weights.push(uniform);
    for step in &service.steps {
        weights.push(step.progress_weight.unwrap_or(uniform));
    }
    let sum: f64 = weights.iter().sum();
    if sum <= 0.0 {
        return Err(ServiceError::validation("service progress weights sum to zero"));
    }
    for w in &mut weights {
        *w /= sum;
    }

    let mut steps = Vec::with_capacity(total);
    steps.push(WorkflowStep {
        job_id: job.job_id,
        step_index: 1,
        service_image: QUERY_CMR_IMAGE.to_string(),
        operation: request.operation.clone(),
        work_item_count: 1,
        completed_item_count: 0,
        failed_item_count: 0,
        progress_weight: weights[0],
        is_sequential: true,
        has_aggregated_output: false,
        operations: vec![],
    });

    for (offset, declared) in service.steps.iter().enumerate() {
        steps.push(WorkflowStep {
            job_id: job.job_id,
            step_index: offset as i32 + 2,
            service_image: declared.image.clone(),
            operation: request.operation.clone(),
            work_item_count: 0,
            completed_item_count: 0,
            failed_item_count: 0,
            progress_weight: weights[offset + 1],
            is_sequential: declared.is_sequential,
            has_aggregated_output: declared.has_aggregated_output,
            operations: declared.operations.clone(),
        });
    }

    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stratus_core::{MemoryObjectStore, ServiceStep, StepOperation};
    use stratus_storage::MemStore;

    fn planner() -> WorkflowPlanner {
        WorkflowPlanner::new(
            Arc::new(MemStore::new()),
            Arc::new(MemoryObjectStore::new()),
            Config::default(),
        )
    }

    fn request() -> TransformationRequest {
        TransformationRequest {
            request: "https://stratus.example.com/C1-PROV/ogc-api-coverages".to_string(),
            collection_ids: vec!["C1-PROV".to_string()],
            granule_ids: vec![],
            granule_name: None,
            max_results: None,
            ignore_errors: false,
            destination_url: None,
            labels: vec!["Prod ".to_string(), "prod".to_string()],
            operation: json!({"format": "image/tiff"}),
        }
    }

    fn service() -> ServiceDefinition {
        ServiceDefinition {
            name: "tiff-subsetter".to_string(),
            steps: vec![ServiceStep {
                image: "svc/subsetter:latest".to_string(),
                operations: vec![StepOperation::SpatialSubset],
                is_sequential: false,
                has_aggregated_output: false,
                progress_weight: None,
            }],
            capabilities: vec![StepOperation::SpatialSubset],
            granule_limit: None,
            force_async: false,
        }
    }

    fn collection(hits: i32, limit: Option<i32>) -> CollectionInfo {
        CollectionInfo {
            id: "C1-PROV".to_string(),
            granule_hits: hits,
            granule_limit: limit,
            variables: vec![],
        }
    }

    #[tokio::test]
    async fn plans_an_async_job_with_query_step_first() {
        let planner = planner();
        let job = planner
            .plan_job("alice", request(), service(), vec![collection(120, None)])
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.num_input_granules, 120);
        assert!(!job.is_synchronous);
        assert_eq!(job.labels, vec!["prod"]);

        let steps = planner.store.list_steps(job.job_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].service_image, QUERY_CMR_IMAGE);
        assert!(steps[0].is_sequential);
        assert_eq!(steps[0].work_item_count, 1);
        let weight_sum: f64 = steps.iter().map(|s| s.progress_weight).sum();
        assert!((weight_sum - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn single_granule_requests_are_synchronous() {
        let planner = planner();
        let mut req = request();
        req.granule_ids = vec!["G1-PROV".to_string()];
        let job = planner
            .plan_job("alice", req, service(), vec![collection(1, None)])
            .await
            .unwrap();
        assert!(job.is_synchronous);
        assert_eq!(job.num_input_granules, 1);
        assert_eq!(job.status, JobStatus::Previewing);
    }

    #[tokio::test]
    async fn force_async_overrides_single_granule() {
        let planner = planner();
        let mut req = request();
        req.granule_ids = vec!["G1-PROV".to_string()];
        let mut svc = service();
        svc.force_async = true;
        let job = planner
            .plan_job("alice", req, svc, vec![collection(1, None)])
            .await
            .unwrap();
        assert!(!job.is_synchronous);
    }

    #[tokio::test]
    async fn collection_limit_binds_and_is_named() {
        let planner = planner();
        let job = planner
            .plan_job("alice", request(), service(), vec![collection(500, Some(40))])
            .await
            .unwrap();
        assert_eq!(job.num_input_granules, 40);
        assert!(job.message.contains("limit on the collection"), "{}", job.message);
    }

    #[tokio::test]
    async fn system_limit_binds_when_smallest() {
        let mut config = Config::default();
        config.max_granule_limit = 25;
        let planner = WorkflowPlanner::new(
            Arc::new(MemStore::new()),
            Arc::new(MemoryObjectStore::new()),
            config,
        );
        let job = planner
            .plan_job("alice", request(), service(), vec![collection(500, Some(100))])
            .await
            .unwrap();
        assert_eq!(job.num_input_granules, 25);
        assert!(job.message.contains("system limit"), "{}", job.message);
    }

    #[tokio::test]
    async fn zero_granules_is_rejected_without_a_job() {
        let planner = planner();
        let err = planner
            .plan_job("alice", request(), service(), vec![collection(0, None)])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RequestValidation(_)));
    }

    #[tokio::test]
    async fn large_jobs_start_in_previewing() {
        let mut config = Config::default();
        config.preview_threshold = 100;
        let planner = WorkflowPlanner::new(
            Arc::new(MemStore::new()),
            Arc::new(MemoryObjectStore::new()),
            config,
        );
        let job = planner
            .plan_job("alice", request(), service(), vec![collection(500, None)])
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Previewing);
    }

    #[tokio::test]
    async fn unsupported_operations_are_rejected() {
        let planner = planner();
        let mut svc = service();
        svc.capabilities = vec![];
        let err = planner
            .plan_job("alice", request(), svc, vec![collection(10, None)])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unsupported(_)));
    }
}
