//! Store trait definition
//!
//! The store exposes coarse operations, each of which runs in a single
//! database transaction. Invariants of the data model hold at every
//! transaction boundary; callers compose behavior from these operations
//! without ever holding locks across object-store I/O.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stratus_core::{
    Job, JobLink, JobStatus, Result, UserWork, WorkItem, WorkItemStatus, WorkflowStep,
};

/// Everything the planner persists when a request becomes a job
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub job: Job,
    /// Dense 1-based steps
    pub steps: Vec<WorkflowStep>,
    /// Input catalog location for the single seed item of step 1
    pub first_item_location: String,
}

/// Selection knobs for the fair-queueing lease
#[derive(Debug, Clone)]
pub struct LeasePolicy {
    /// Lease lifetime; the reaper reclaims items past it
    pub visibility_timeout: Duration,
    /// Serve any owner's synchronous work before any asynchronous work
    /// (off: the synchronous preference applies within one owner only)
    pub sync_priority_across_owners: bool,
}

/// A leased work item together with its step's operation payload
#[derive(Debug, Clone)]
pub struct LeasedWork {
    pub item: WorkItem,
    /// The step's opaque data-operation template
    pub operation: serde_json::Value,
    /// Granule budget of the owning job, for catalog-query items
    pub num_input_granules: i32,
}

/// A work item loaded with its surrounding workflow state
#[derive(Debug, Clone)]
pub struct ItemContext {
    pub item: WorkItem,
    pub job: Job,
    pub step: WorkflowStep,
    pub next_step: Option<WorkflowStep>,
}

/// State change to commit for a successfully finished item
#[derive(Debug, Clone)]
pub struct CompletionUpdate {
    pub item_id: i64,
    /// `Successful` or `Warning`
    pub status: WorkItemStatus,
    pub result_uris: Vec<String>,
    pub output_item_sizes: Vec<i64>,
    /// Input catalog locations for next-step items (empty when the next
    /// step aggregates or no next step exists)
    pub next_item_locations: Vec<String>,
    /// Output links to append when this is the final step
    pub links: Vec<JobLink>,
}

/// What a completion commit did
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub job_status: JobStatus,
    /// The commit took the job to a terminal state
    pub job_terminal: bool,
    /// The commit completed the item's step and the next step aggregates:
    /// the caller must now build the aggregate catalog and insert the
    /// single aggregated item. Set for exactly one commit per step.
    pub aggregation_ready: bool,
    /// The job was canceled before the report arrived; the item outcome
    /// was coerced to canceled and nothing was propagated
    pub coerced_to_canceled: bool,
}

/// State change to commit for a failed item report
#[derive(Debug, Clone)]
pub struct FailureUpdate {
    pub item_id: i64,
    pub message: String,
    /// Retries allowed per item
    pub retry_limit: i32,
}

/// What a failure commit did
#[derive(Debug, Clone)]
pub enum FailureOutcome {
    /// Retry budget remained: the item is ready again
    Retried { retry_count: i32 },
    /// The item failed permanently; the job continues (ignore-errors)
    ItemFailed {
        job_status: JobStatus,
        job_terminal: bool,
        aggregation_ready: bool,
    },
    /// The item failed permanently and took the job down with it
    JobFailed,
    /// The job was already canceled; the item was coerced to canceled
    CoercedToCanceled,
}

/// Result of a lease-expiry sweep
#[derive(Debug, Clone, Default)]
pub struct ExpiredLeases {
    /// Items returned to ready with an incremented retry count
    pub requeued: Vec<i64>,
    /// Items whose retry budget is exhausted; the caller routes these
    /// through the failure path
    pub exhausted: Vec<i64>,
}

/// One recorded permanent failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub job_id: Uuid,
    /// Input catalog location of the failed item
    pub url: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Job progress from step counters: Σ (terminal items / total) × weight,
/// scaled to 0..100, clamped non-decreasing and held below 100 until the
/// job itself goes terminal.
pub(crate) fn computed_progress(steps: &[WorkflowStep], current: i32) -> i32 {
    let raw: f64 = steps
        .iter()
        .map(|s| s.progress_fraction() * s.progress_weight)
        .sum::<f64>()
        * 100.0;
    (raw.floor() as i32).clamp(0, 99).max(current)
}

/// Final status once every step is complete.
pub(crate) fn final_status(steps: &[WorkflowStep]) -> JobStatus {
    if steps.iter().any(|s| s.failed_item_count > 0) {
        JobStatus::CompleteWithErrors
    } else {
        JobStatus::Successful
    }
}

/// Durable state behind the orchestrator
///
/// Implementations must be thread-safe; concurrent leases must be
/// serialised so no item is ever returned twice.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // =========================================================================
    // Planner
    // =========================================================================

    /// Persist a planned job: the job row, its steps, the seed item of
    /// step 1, and the owner's user-work entry, atomically.
    async fn create_job(&self, plan: JobPlan) -> Result<Job>;

    // =========================================================================
    // Reads
    // =========================================================================

    async fn get_job(&self, job_id: Uuid) -> Result<Job>;

    async fn list_steps(&self, job_id: Uuid) -> Result<Vec<WorkflowStep>>;

    async fn get_work_item(&self, id: i64) -> Result<WorkItem>;

    /// Ready/in-flight work per (owner, service image); `None` when the
    /// owner has never had work for the image.
    async fn get_user_work(&self, username: &str, service_image: &str)
        -> Result<Option<UserWork>>;

    async fn list_job_links(&self, job_id: Uuid) -> Result<Vec<JobLink>>;

    async fn list_job_errors(&self, job_id: Uuid) -> Result<Vec<JobError>>;

    /// Result catalog locations of every successful item of a step, in
    /// sort order. Input to aggregate catalog construction.
    async fn list_successful_results(&self, job_id: Uuid, step_index: i32)
        -> Result<Vec<String>>;

    // =========================================================================
    // Dispatcher
    // =========================================================================

    /// Atomically select and lease the best ready item for a service
    /// image under the fair-queueing policy, or return `None`.
    ///
    /// Selection: owners with the fewest in-flight items first, oldest
    /// `last_worked_at` next, oldest ready item as the stable tie-break;
    /// within the chosen owner, synchronous jobs before asynchronous,
    /// then oldest `updated_at`; within the chosen job, smallest
    /// (step index, sort index). Items of paused, canceled, failed or
    /// otherwise non-dispatchable jobs are never returned. Sequential
    /// steps are served one item at a time in sort order.
    async fn lease_work_item(
        &self,
        service_image: &str,
        policy: &LeasePolicy,
    ) -> Result<Option<LeasedWork>>;

    // =========================================================================
    // Progress engine
    // =========================================================================

    /// Load an item with its job, step, and successor step.
    async fn load_item_context(&self, id: i64) -> Result<ItemContext>;

    /// Commit a successful item report. Validates the transition inside
    /// the transaction (rechecking job state under the job row lock),
    /// records results, inserts prepared next-step items, appends links,
    /// advances progress, and transitions the job when its last step
    /// completed.
    async fn apply_completion(&self, update: CompletionUpdate) -> Result<CompletionOutcome>;

    /// Commit a failed item report: requeue while retry budget remains,
    /// otherwise fail the item, record the error, and apply the job's
    /// error policy (fail the job, or continue under ignore-errors).
    async fn apply_failure(&self, update: FailureUpdate) -> Result<FailureOutcome>;

    /// Insert the single aggregated work item for an aggregating step.
    /// A no-op returning `None` when the step already has its item, so
    /// the aggregation handoff is idempotent.
    async fn insert_aggregated_item(
        &self,
        job_id: Uuid,
        step_index: i32,
        catalog_location: &str,
    ) -> Result<Option<i64>>;

    // =========================================================================
    // Control plane
    // =========================================================================

    /// Transition a job's status, validating against the state machine.
    /// Canceling cascades to all non-terminal items. Returns the updated
    /// job. A repeated cancel is a no-op.
    async fn transition_job(
        &self,
        job_id: Uuid,
        to: JobStatus,
        message: Option<String>,
    ) -> Result<Job>;

    /// Add normalized labels to jobs. Fails with `NotFound` when any of
    /// the jobs does not exist.
    async fn add_labels(&self, job_ids: &[Uuid], labels: &[String]) -> Result<()>;

    /// Remove labels from jobs. Fails with `NotFound` when any of the
    /// jobs does not exist.
    async fn remove_labels(&self, job_ids: &[Uuid], labels: &[String]) -> Result<()>;

    // =========================================================================
    // Lease reaper
    // =========================================================================

    /// Requeue running items whose lease expired before `now` and retry
    /// budget remains; report the rest as exhausted. Safe to run from
    /// multiple instances concurrently.
    async fn expire_leases(&self, now: DateTime<Utc>, retry_limit: i32) -> Result<ExpiredLeases>;
}
