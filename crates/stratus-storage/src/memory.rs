//! In-memory implementation of the store
//!
//! Primarily for tests: same semantics as the PostgreSQL implementation,
//! with one process-wide lock standing in for per-operation transactions.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use stratus_core::{
    Job, JobLink, JobStatus, Result, ServiceError, UserWork, WorkItem, WorkItemStatus,
    WorkflowStep,
};

use crate::store::*;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    steps: HashMap<Uuid, Vec<WorkflowStep>>,
    items: BTreeMap<i64, WorkItem>,
    user_work: HashMap<(String, String), UserWork>,
    links: HashMap<Uuid, Vec<JobLink>>,
    errors: HashMap<Uuid, Vec<JobError>>,
    next_item_id: i64,
}

impl Inner {
    fn job(&self, job_id: Uuid) -> Result<&Job> {
        self.jobs
            .get(&job_id)
            .ok_or_else(|| ServiceError::job_not_found(job_id))
    }

    fn item(&self, id: i64) -> Result<&WorkItem> {
        self.items
            .get(&id)
            .ok_or_else(|| ServiceError::item_not_found(id))
    }

    fn step(&self, job_id: Uuid, step_index: i32) -> Result<&WorkflowStep> {
        self.steps
            .get(&job_id)
            .and_then(|steps| steps.iter().find(|s| s.step_index == step_index))
            .ok_or_else(|| ServiceError::NotFound(format!("workflow step {job_id}/{step_index}")))
    }

    fn step_mut(&mut self, job_id: Uuid, step_index: i32) -> Result<&mut WorkflowStep> {
        self.steps
            .get_mut(&job_id)
            .and_then(|steps| steps.iter_mut().find(|s| s.step_index == step_index))
            .ok_or_else(|| ServiceError::NotFound(format!("workflow step {job_id}/{step_index}")))
    }

    fn bump_user_work(
        &mut self,
        username: &str,
        service_image: &str,
        ready_delta: i32,
        running_delta: i32,
        touch_last_worked: bool,
    ) {
        let entry = self
            .user_work
            .entry((username.to_string(), service_image.to_string()))
            .or_insert_with(|| UserWork::new(username, service_image));
        entry.ready_count = (entry.ready_count + ready_delta).max(0);
        entry.running_count = (entry.running_count + running_delta).max(0);
        if touch_last_worked {
            entry.last_worked_at = Utc::now();
        }
    }

    fn insert_item(
        &mut self,
        job_id: Uuid,
        step_index: i32,
        service_image: &str,
        location: &str,
        sort_index: i32,
    ) -> i64 {
        self.next_item_id += 1;
        let id = self.next_item_id;
        let now = Utc::now();
        self.items.insert(
            id,
            WorkItem {
                id,
                job_id,
                step_index,
                service_image: service_image.to_string(),
                status: WorkItemStatus::Ready,
                retry_count: 0,
                stac_catalog_location: location.to_string(),
                result_uris: Vec::new(),
                output_item_sizes: Vec::new(),
                sort_index,
                started_at: None,
                leased_until: None,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    fn cancel_job_items(&mut self, job_id: Uuid) {
        let username = match self.jobs.get(&job_id) {
            Some(job) => job.username.clone(),
            None => return,
        };
        let mut ready_deltas: HashMap<String, i32> = HashMap::new();
        let mut running_deltas: HashMap<String, i32> = HashMap::new();
        for item in self.items.values_mut().filter(|i| i.job_id == job_id) {
            match item.status {
                WorkItemStatus::Ready => {
                    *ready_deltas.entry(item.service_image.clone()).or_default() -= 1;
                }
                WorkItemStatus::Queued | WorkItemStatus::Running => {
                    *running_deltas.entry(item.service_image.clone()).or_default() -= 1;
                }
                _ => continue,
            }
            item.status = WorkItemStatus::Canceled;
            item.leased_until = None;
            item.updated_at = Utc::now();
        }
        for (image, delta) in ready_deltas {
            self.bump_user_work(&username, &image, delta, 0, false);
        }
        for (image, delta) in running_deltas {
            self.bump_user_work(&username, &image, 0, delta, false);
        }
    }

    fn set_job(&mut self, job_id: Uuid, status: JobStatus, progress: i32, message: Option<&str>) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.status = status;
            job.progress = progress;
            if let Some(message) = message {
                job.message = message.to_string();
            }
            job.updated_at = Utc::now();
        }
    }

    /// True when an item of a sequential step must wait its turn.
    fn sequential_blocked(&self, item: &WorkItem) -> bool {
        let Ok(step) = self.step(item.job_id, item.step_index) else {
            return true;
        };
        if !step.is_sequential {
            return false;
        }
        let siblings: Vec<&WorkItem> = self
            .items
            .values()
            .filter(|i| i.job_id == item.job_id && i.step_index == item.step_index)
            .collect();
        if siblings
            .iter()
            .any(|i| matches!(i.status, WorkItemStatus::Queued | WorkItemStatus::Running))
        {
            return true;
        }
        let min_ready = siblings
            .iter()
            .filter(|i| i.status == WorkItemStatus::Ready)
            .map(|i| i.sort_index)
            .min();
        min_ready != Some(item.sort_index)
    }
}

/// In-memory store
///
/// # Example
///
/// ```
/// use stratus_storage::MemStore;
///
/// let store = MemStore::new();
/// ```
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of work items across all jobs (for tests).
    pub fn item_count(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Overwrite a job's updated_at (test setup for fair-queue ordering).
    pub fn set_job_updated_at(&self, job_id: Uuid, at: DateTime<Utc>) {
        if let Some(job) = self.inner.lock().jobs.get_mut(&job_id) {
            job.updated_at = at;
        }
    }

    /// All items of a job in (step, sort) order (for tests).
    pub fn job_items(&self, job_id: Uuid) -> Vec<WorkItem> {
        let inner = self.inner.lock();
        let mut items: Vec<WorkItem> = inner
            .items
            .values()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.step_index, i.sort_index));
        items
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create_job(&self, plan: JobPlan) -> Result<Job> {
        let mut inner = self.inner.lock();
        let job = plan.job.clone();

        let first_step = plan
            .steps
            .first()
            .ok_or_else(|| ServiceError::server("job plan has no steps"))?;
        let first_image = first_step.service_image.clone();

        inner.jobs.insert(job.job_id, job.clone());
        inner.steps.insert(job.job_id, plan.steps.clone());
        inner.insert_item(job.job_id, 1, &first_image, &plan.first_item_location, 0);
        inner.bump_user_work(&job.username, &first_image, 1, 0, false);
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        self.inner.lock().job(job_id).cloned()
    }

    async fn list_steps(&self, job_id: Uuid) -> Result<Vec<WorkflowStep>> {
        let inner = self.inner.lock();
        inner.job(job_id)?;
        let mut steps = inner.steps.get(&job_id).cloned().unwrap_or_default();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps)
    }

    async fn get_work_item(&self, id: i64) -> Result<WorkItem> {
        self.inner.lock().item(id).cloned()
    }

    async fn get_user_work(
        &self,
        username: &str,
        service_image: &str,
    ) -> Result<Option<UserWork>> {
        Ok(self
            .inner
            .lock()
            .user_work
            .get(&(username.to_string(), service_image.to_string()))
            .cloned())
    }

    async fn list_job_links(&self, job_id: Uuid) -> Result<Vec<JobLink>> {
        Ok(self.inner.lock().links.get(&job_id).cloned().unwrap_or_default())
    }

    async fn list_job_errors(&self, job_id: Uuid) -> Result<Vec<JobError>> {
        Ok(self.inner.lock().errors.get(&job_id).cloned().unwrap_or_default())
    }

    async fn list_successful_results(
        &self,
        job_id: Uuid,
        step_index: i32,
    ) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let mut items: Vec<&WorkItem> = inner
            .items
            .values()
            .filter(|i| {
                i.job_id == job_id && i.step_index == step_index && i.status.is_successful()
            })
            .collect();
        items.sort_by_key(|i| i.sort_index);
        Ok(items
            .iter()
            .flat_map(|i| i.result_uris.iter().cloned())
            .collect())
    }

    async fn lease_work_item(
        &self,
        service_image: &str,
        policy: &LeasePolicy,
    ) -> Result<Option<LeasedWork>> {
        let mut inner = self.inner.lock();

        // Candidate set: ready items of dispatchable jobs, sequential
        // steps one item at a time in sort order.
        let candidates: Vec<(i64, Uuid, i32, i32, String, bool, DateTime<Utc>)> = inner
            .items
            .values()
            .filter(|item| {
                item.service_image == service_image
                    && item.status == WorkItemStatus::Ready
                    && inner
                        .jobs
                        .get(&item.job_id)
                        .map(|j| j.status.is_dispatchable())
                        .unwrap_or(false)
                    && !inner.sequential_blocked(item)
            })
            .map(|item| {
                let job = &inner.jobs[&item.job_id];
                (
                    item.id,
                    item.job_id,
                    item.step_index,
                    item.sort_index,
                    job.username.clone(),
                    job.is_synchronous,
                    job.updated_at,
                )
            })
            .collect();

        if candidates.is_empty() {
            return Ok(None);
        }

        // Owner: fewest in flight, longest neglected, oldest candidate as
        // the stable tie-break. Optionally synchronous-first across owners.
        struct OwnerRank {
            has_sync: bool,
            running: i32,
            last_worked: DateTime<Utc>,
            min_item: i64,
        }
        let mut owners: HashMap<&str, OwnerRank> = HashMap::new();
        for (id, _, _, _, username, is_sync, _) in &candidates {
            let work = inner
                .user_work
                .get(&(username.clone(), service_image.to_string()));
            let rank = owners.entry(username.as_str()).or_insert(OwnerRank {
                has_sync: false,
                running: work.map(|w| w.running_count).unwrap_or(0),
                last_worked: work
                    .map(|w| w.last_worked_at)
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                min_item: *id,
            });
            rank.has_sync |= *is_sync;
            rank.min_item = rank.min_item.min(*id);
        }
        let owner = owners
            .iter()
            .min_by_key(|(_, r)| {
                let sync_key = if policy.sync_priority_across_owners {
                    !r.has_sync
                } else {
                    false
                };
                (sync_key, r.running, r.last_worked, r.min_item)
            })
            .map(|(username, _)| username.to_string())
            .unwrap_or_default();

        // Job: synchronous before asynchronous, then oldest.
        struct JobRank {
            is_sync: bool,
            updated_at: DateTime<Utc>,
            min_item: i64,
        }
        let mut jobs: HashMap<Uuid, JobRank> = HashMap::new();
        for (id, job_id, _, _, username, is_sync, updated_at) in &candidates {
            if username != &owner {
                continue;
            }
            let rank = jobs.entry(*job_id).or_insert(JobRank {
                is_sync: *is_sync,
                updated_at: *updated_at,
                min_item: *id,
            });
            rank.min_item = rank.min_item.min(*id);
        }
        let job_id = jobs
            .iter()
            .min_by_key(|(_, r)| (!r.is_sync, r.updated_at, r.min_item))
            .map(|(job_id, _)| *job_id)
            .unwrap_or_default();

        // Item: smallest (step, sort).
        let item_id = candidates
            .iter()
            .filter(|(_, j, _, _, _, _, _)| *j == job_id)
            .min_by_key(|(_, _, step, sort, _, _, _)| (*step, *sort))
            .map(|(id, _, _, _, _, _, _)| *id)
            .ok_or_else(|| ServiceError::server("lease candidate disappeared"))?;

        let leased_until =
            Utc::now() + chrono::Duration::from_std(policy.visibility_timeout).unwrap_or_default();
        let (item, step_index) = {
            let item = inner
                .items
                .get_mut(&item_id)
                .ok_or_else(|| ServiceError::item_not_found(item_id))?;
            item.status = WorkItemStatus::Running;
            item.started_at = Some(Utc::now());
            item.leased_until = Some(leased_until);
            item.updated_at = Utc::now();
            (item.clone(), item.step_index)
        };

        inner.bump_user_work(&owner, service_image, -1, 1, true);

        let operation = inner.step(job_id, step_index)?.operation.clone();
        let num_input_granules = inner.job(job_id)?.num_input_granules;

        Ok(Some(LeasedWork {
            item,
            operation,
            num_input_granules,
        }))
    }

    async fn load_item_context(&self, id: i64) -> Result<ItemContext> {
        let inner = self.inner.lock();
        let item = inner.item(id)?.clone();
        let job = inner.job(item.job_id)?.clone();
        let step = inner.step(item.job_id, item.step_index)?.clone();
        let next_step = inner.step(item.job_id, item.step_index + 1).ok().cloned();
        Ok(ItemContext {
            item,
            job,
            step,
            next_step,
        })
    }

    async fn apply_completion(&self, update: CompletionUpdate) -> Result<CompletionOutcome> {
        if !update.status.is_successful() {
            return Err(ServiceError::server(
                "apply_completion requires a successful outcome",
            ));
        }

        let mut inner = self.inner.lock();
        let item = inner.item(update.item_id)?.clone();
        let job = inner.job(item.job_id)?.clone();

        if job.status == JobStatus::Canceled {
            // Reports racing a cancel are accepted and coerced; an item
            // the cascade already canceled needs no further change.
            match item.status {
                WorkItemStatus::Canceled => {}
                s if s.is_terminal() => {
                    return Err(ServiceError::conflict("work item is already terminal"));
                }
                _ => {
                    if let Some(i) = inner.items.get_mut(&update.item_id) {
                        i.status = WorkItemStatus::Canceled;
                        i.leased_until = None;
                        i.updated_at = Utc::now();
                    }
                    inner.bump_user_work(&job.username, &item.service_image, 0, -1, false);
                }
            }
            return Ok(CompletionOutcome {
                job_status: JobStatus::Canceled,
                job_terminal: true,
                aggregation_ready: false,
                coerced_to_canceled: true,
            });
        }
        if job.status.is_terminal() {
            return Err(ServiceError::conflict(format!(
                "job is already {}",
                job.status
            )));
        }
        if item.status.is_terminal() {
            return Err(ServiceError::conflict("work item is already terminal"));
        }
        if !matches!(item.status, WorkItemStatus::Running | WorkItemStatus::Queued) {
            return Err(ServiceError::conflict(format!(
                "work item is {}, not leased",
                item.status
            )));
        }

        if let Some(i) = inner.items.get_mut(&update.item_id) {
            i.status = update.status;
            i.result_uris = update.result_uris.clone();
            i.output_item_sizes = update.output_item_sizes.clone();
            i.leased_until = None;
            i.updated_at = Utc::now();
        }
        inner
            .step_mut(item.job_id, item.step_index)?
            .completed_item_count += 1;

        let step = inner.step(item.job_id, item.step_index)?.clone();
        let next_step = inner.step(item.job_id, item.step_index + 1).ok().cloned();

        let mut aggregation_ready = false;
        match next_step {
            Some(next) if !next.has_aggregated_output => {
                if !update.next_item_locations.is_empty() {
                    for (offset, location) in update.next_item_locations.iter().enumerate() {
                        inner.insert_item(
                            item.job_id,
                            next.step_index,
                            &next.service_image,
                            location,
                            next.work_item_count + offset as i32,
                        );
                    }
                    inner
                        .step_mut(item.job_id, next.step_index)?
                        .work_item_count += update.next_item_locations.len() as i32;
                    inner.bump_user_work(
                        &job.username,
                        &next.service_image,
                        update.next_item_locations.len() as i32,
                        0,
                        false,
                    );
                }
            }
            Some(next) if next.has_aggregated_output => {
                aggregation_ready =
                    step.is_complete() && step.completed_item_count > 0 && next.work_item_count == 0;
            }
            _ => {
                inner
                    .links
                    .entry(item.job_id)
                    .or_default()
                    .extend(update.links.iter().cloned());
            }
        }

        inner.bump_user_work(&job.username, &item.service_image, 0, -1, false);

        let steps = inner.steps.get(&item.job_id).cloned().unwrap_or_default();
        let all_complete = steps.iter().all(|s| s.is_complete()) && !aggregation_ready;
        let (new_status, progress) = if all_complete {
            let status = final_status(&steps);
            Job::validate_transition(job.status, status)?;
            (status, 100)
        } else {
            (job.status, computed_progress(&steps, job.progress))
        };
        inner.set_job(item.job_id, new_status, progress, None);

        Ok(CompletionOutcome {
            job_status: new_status,
            job_terminal: new_status.is_terminal(),
            aggregation_ready,
            coerced_to_canceled: false,
        })
    }

    async fn apply_failure(&self, update: FailureUpdate) -> Result<FailureOutcome> {
        let mut inner = self.inner.lock();
        let item = inner.item(update.item_id)?.clone();
        let job = inner.job(item.job_id)?.clone();

        if job.status == JobStatus::Canceled {
            match item.status {
                WorkItemStatus::Canceled => {}
                s if s.is_terminal() => {
                    return Err(ServiceError::conflict("work item is already terminal"));
                }
                _ => {
                    if let Some(i) = inner.items.get_mut(&update.item_id) {
                        i.status = WorkItemStatus::Canceled;
                        i.leased_until = None;
                        i.updated_at = Utc::now();
                    }
                    inner.bump_user_work(&job.username, &item.service_image, 0, -1, false);
                }
            }
            return Ok(FailureOutcome::CoercedToCanceled);
        }
        if job.status.is_terminal() {
            return Err(ServiceError::conflict(format!(
                "job is already {}",
                job.status
            )));
        }
        if !matches!(item.status, WorkItemStatus::Running | WorkItemStatus::Queued) {
            return Err(ServiceError::conflict(format!(
                "work item is {}, not leased",
                item.status
            )));
        }

        if item.retry_count < update.retry_limit {
            if let Some(i) = inner.items.get_mut(&update.item_id) {
                i.status = WorkItemStatus::Ready;
                i.retry_count += 1;
                i.leased_until = None;
                i.started_at = None;
                i.updated_at = Utc::now();
            }
            inner.bump_user_work(&job.username, &item.service_image, 1, -1, false);
            return Ok(FailureOutcome::Retried {
                retry_count: item.retry_count + 1,
            });
        }

        if let Some(i) = inner.items.get_mut(&update.item_id) {
            i.status = WorkItemStatus::Failed;
            i.leased_until = None;
            i.updated_at = Utc::now();
        }
        inner
            .step_mut(item.job_id, item.step_index)?
            .failed_item_count += 1;
        inner.errors.entry(item.job_id).or_default().push(JobError {
            job_id: item.job_id,
            url: item.stac_catalog_location.clone(),
            message: Job::truncate_message(&update.message),
            created_at: Utc::now(),
        });
        inner.bump_user_work(&job.username, &item.service_image, 0, -1, false);

        let step = inner.step(item.job_id, item.step_index)?.clone();
        let next_step = inner.step(item.job_id, item.step_index + 1).ok().cloned();
        let step_all_failed = step.is_complete() && step.completed_item_count == 0;

        if !job.ignore_errors || step_all_failed {
            inner.cancel_job_items(item.job_id);
            let message = Job::truncate_message(&update.message);
            inner.set_job(item.job_id, JobStatus::Failed, job.progress, Some(&message));
            return Ok(FailureOutcome::JobFailed);
        }

        let aggregation_ready = next_step
            .map(|n| n.has_aggregated_output && step.is_complete() && n.work_item_count == 0)
            .unwrap_or(false)
            && step.completed_item_count > 0;

        let steps = inner.steps.get(&item.job_id).cloned().unwrap_or_default();
        let all_complete = steps.iter().all(|s| s.is_complete()) && !aggregation_ready;
        let (new_status, progress) = if all_complete {
            let status = final_status(&steps);
            Job::validate_transition(job.status, status)?;
            (status, 100)
        } else {
            let status = if matches!(job.status, JobStatus::Running | JobStatus::Previewing) {
                JobStatus::RunningWithErrors
            } else {
                job.status
            };
            (status, computed_progress(&steps, job.progress))
        };
        inner.set_job(item.job_id, new_status, progress, None);

        Ok(FailureOutcome::ItemFailed {
            job_status: new_status,
            job_terminal: new_status.is_terminal(),
            aggregation_ready,
        })
    }

    async fn insert_aggregated_item(
        &self,
        job_id: Uuid,
        step_index: i32,
        catalog_location: &str,
    ) -> Result<Option<i64>> {
        let mut inner = self.inner.lock();
        let job = inner.job(job_id)?.clone();
        if job.status.is_terminal() {
            return Ok(None);
        }
        let step = inner.step(job_id, step_index)?.clone();
        if step.work_item_count > 0 {
            return Ok(None);
        }

        let id = inner.insert_item(job_id, step_index, &step.service_image, catalog_location, 0);
        inner.step_mut(job_id, step_index)?.work_item_count = 1;
        inner.bump_user_work(&job.username, &step.service_image, 1, 0, false);
        Ok(Some(id))
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        to: JobStatus,
        message: Option<String>,
    ) -> Result<Job> {
        let mut inner = self.inner.lock();
        let job = inner.job(job_id)?.clone();

        if to == JobStatus::Canceled && job.status == JobStatus::Canceled {
            return Ok(job);
        }
        Job::validate_transition(job.status, to)?;

        if to == JobStatus::Canceled {
            inner.cancel_job_items(job_id);
        }
        inner.set_job(job_id, to, job.progress, message.as_deref());
        inner.job(job_id).cloned()
    }

    async fn add_labels(&self, job_ids: &[Uuid], labels: &[String]) -> Result<()> {
        let mut inner = self.inner.lock();
        for job_id in job_ids {
            inner.job(*job_id)?;
        }
        for job_id in job_ids {
            if let Some(job) = inner.jobs.get_mut(job_id) {
                job.labels.extend(labels.iter().cloned());
                job.labels.sort();
                job.labels.dedup();
            }
        }
        Ok(())
    }

    async fn remove_labels(&self, job_ids: &[Uuid], labels: &[String]) -> Result<()> {
        let mut inner = self.inner.lock();
        for job_id in job_ids {
            inner.job(*job_id)?;
        }
        for job_id in job_ids {
            if let Some(job) = inner.jobs.get_mut(job_id) {
                job.labels.retain(|l| !labels.contains(l));
            }
        }
        Ok(())
    }

    async fn expire_leases(&self, now: DateTime<Utc>, retry_limit: i32) -> Result<ExpiredLeases> {
        let mut inner = self.inner.lock();
        let expired_ids: Vec<i64> = inner
            .items
            .values()
            .filter(|i| {
                i.status == WorkItemStatus::Running
                    && i.leased_until.map(|t| t < now).unwrap_or(false)
            })
            .map(|i| i.id)
            .collect();

        let mut result = ExpiredLeases::default();
        for id in expired_ids {
            let item = inner.item(id)?.clone();
            if item.retry_count < retry_limit {
                if let Some(i) = inner.items.get_mut(&id) {
                    i.status = WorkItemStatus::Ready;
                    i.retry_count += 1;
                    i.leased_until = None;
                    i.started_at = None;
                    i.updated_at = Utc::now();
                }
                let username = inner.job(item.job_id)?.username.clone();
                inner.bump_user_work(&username, &item.service_image, 1, -1, false);
                result.requeued.push(id);
            } else {
                result.exhausted.push(id);
            }
        }
        Ok(result)
    }
}
