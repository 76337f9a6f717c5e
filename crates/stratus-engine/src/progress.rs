//! Progress engine
//!
//! Consumes worker reports, fans outputs into the next step (or
//! aggregates them), applies the retry and ignore-errors policies,
//! drives the job lifecycle from the control plane, and publishes the
//! one-shot completion signal for synchronous jobs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use stratus_core::{
    stac, Config, Job, JobLink, JobStatus, ObjectStore, Result, ServiceError, WorkItemStatus,
    WorkItemUpdate,
};
use stratus_storage::{
    CompletionOutcome, CompletionUpdate, FailureOutcome, FailureUpdate, ItemContext, Store,
};

use crate::signals::CompletionHub;

/// Retries granted to a worker-reported cancel before the item fails.
/// Deliberately smaller than the ordinary retry limit: one requeue, then
/// the failure path.
const WORKER_CANCEL_RETRY_LIMIT: i32 = 1;

pub struct ProgressEngine {
    store: Arc<dyn Store>,
    objects: Arc<dyn ObjectStore>,
    config: Config,
    signals: Arc<CompletionHub>,
}

impl ProgressEngine {
    pub fn new(
        store: Arc<dyn Store>,
        objects: Arc<dyn ObjectStore>,
        config: Config,
        signals: Arc<CompletionHub>,
    ) -> Self {
        Self {
            store,
            objects,
            config,
            signals,
        }
    }

    /// Handle a worker's report for a leased item.
    #[instrument(skip(self, update), fields(item_id = update.id, status = %update.status))]
    pub async fn handle_work_report(&self, update: WorkItemUpdate) -> Result<()> {
        match update.status {
            WorkItemStatus::Successful | WorkItemStatus::Warning => {
                self.complete_item(update).await
            }
            WorkItemStatus::Failed => {
                let message = update
                    .error_message
                    .unwrap_or_else(|| "service failed with an unknown error".to_string());
                self.fail_item(update.id, &message).await
            }
            // A worker-reported cancel is not authoritative: it takes the
            // failure path, retried once and then failed. Caller-initiated
            // cancel goes through the control plane instead.
            WorkItemStatus::Canceled => {
                self.fail_item_with_limit(
                    update.id,
                    "work item canceled by service",
                    WORKER_CANCEL_RETRY_LIMIT,
                )
                .await
            }
            other => Err(ServiceError::validation(format!(
                "a worker cannot report status {other}"
            ))),
        }
    }

    async fn complete_item(&self, update: WorkItemUpdate) -> Result<()> {
        let ctx = self.store.load_item_context(update.id).await?;

        // Fan out one next-step item per output catalog unless the next
        // step aggregates (deferred until the whole step completes).
        let next_item_locations = match &ctx.next_step {
            Some(next) if !next.has_aggregated_output => update.results.clone(),
            _ => Vec::new(),
        };
        let links = if ctx.next_step.is_none() {
            output_links(&update.results)
        } else {
            Vec::new()
        };

        let outcome = self
            .store
            .apply_completion(CompletionUpdate {
                item_id: update.id,
                status: update.status,
                result_uris: update.results,
                output_item_sizes: update.output_item_sizes,
                next_item_locations,
                links,
            })
            .await?;

        if outcome.coerced_to_canceled {
            info!(item_id = update.id, "completion coerced to canceled");
            return Ok(());
        }
        self.finish_aggregation_and_signal(&ctx, &outcome).await
    }

    /// Fail an item: requeue while retries remain, otherwise apply the
    /// job's error policy. Also the entry point for reaper-exhausted
    /// leases.
    pub async fn fail_item(&self, item_id: i64, message: &str) -> Result<()> {
        self.fail_item_with_limit(item_id, message, self.config.work_item_retry_limit)
            .await
    }

    async fn fail_item_with_limit(
        &self,
        item_id: i64,
        message: &str,
        retry_limit: i32,
    ) -> Result<()> {
        let ctx = self.store.load_item_context(item_id).await?;
        let outcome = self
            .store
            .apply_failure(FailureUpdate {
                item_id,
                message: message.to_string(),
                retry_limit,
            })
            .await?;

        match outcome {
            FailureOutcome::Retried { retry_count } => {
                info!(item_id, retry_count, "requeued failed work item");
                Ok(())
            }
            FailureOutcome::CoercedToCanceled => Ok(()),
            FailureOutcome::JobFailed => {
                warn!(item_id, job_id = %ctx.job.job_id, "work item failure failed the job");
                self.signals.publish(ctx.job.job_id, JobStatus::Failed);
                Ok(())
            }
            FailureOutcome::ItemFailed {
                job_status,
                job_terminal,
                aggregation_ready,
            } => {
                warn!(item_id, job_id = %ctx.job.job_id, %job_status, "work item failed permanently");
                let outcome = CompletionOutcome {
                    job_status,
                    job_terminal,
                    aggregation_ready,
                    coerced_to_canceled: false,
                };
                self.finish_aggregation_and_signal(&ctx, &outcome).await
            }
        }
    }

    async fn finish_aggregation_and_signal(
        &self,
        ctx: &ItemContext,
        outcome: &CompletionOutcome,
    ) -> Result<()> {
        if outcome.aggregation_ready {
            self.emit_aggregated_item(ctx).await?;
        }
        if outcome.job_terminal {
            self.signals.publish(ctx.job.job_id, outcome.job_status);
        }
        Ok(())
    }

    /// Build the aggregate catalog for a completed step and hand its
    /// head page to the (single) work item of the aggregating step.
    ///
    /// Pages are written to the object store outside any database
    /// transaction; the item insert afterwards is idempotent, so a crash
    /// between the two leaves only unreferenced pages behind.
    async fn emit_aggregated_item(&self, ctx: &ItemContext) -> Result<()> {
        let job_id = ctx.job.job_id;
        let source_step = ctx.step.step_index;
        let next_index = source_step + 1;

        let item_hrefs = self
            .store
            .list_successful_results(job_id, source_step)
            .await?;

        let key = |page: usize| format!("jobs/{job_id}/aggregates/step{next_index}/catalog{page}.json");
        let objects = &self.objects;
        let pages = stac::paginate(
            &format!("{job_id}-step{next_index}"),
            "aggregate inputs",
            &item_hrefs,
            self.config.aggregate_stac_catalog_max_page_size,
            |page| objects.uri_for(&key(page)),
        );

        let mut head_uri = None;
        for (index, page) in pages.iter().enumerate() {
            let value = serde_json::to_value(page)
                .map_err(|e| ServiceError::server(format!("aggregate catalog encode: {e}")))?;
            let uri = self.objects.put_json(&key(index), &value).await?;
            if index == 0 {
                head_uri = Some(uri);
            }
        }
        let head_uri =
            head_uri.ok_or_else(|| ServiceError::server("aggregate produced no pages"))?;

        match self
            .store
            .insert_aggregated_item(job_id, next_index, &head_uri)
            .await?
        {
            Some(item_id) => {
                info!(
                    %job_id,
                    step_index = next_index,
                    item_id,
                    items = item_hrefs.len(),
                    pages = pages.len(),
                    "emitted aggregated work item"
                );
            }
            None => {
                info!(%job_id, step_index = next_index, "aggregated item already present");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Control plane
    // =========================================================================

    pub async fn pause_job(&self, job_id: Uuid) -> Result<Job> {
        let job = self.store.get_job(job_id).await?;
        if !job.status.can_pause() {
            return Err(ServiceError::conflict(format!(
                "cannot pause a job in status {}",
                job.status
            )));
        }
        self.store
            .transition_job(job_id, JobStatus::Paused, None)
            .await
    }

    pub async fn resume_job(&self, job_id: Uuid) -> Result<Job> {
        let job = self.store.get_job(job_id).await?;
        if !job.status.can_resume() {
            return Err(ServiceError::conflict(format!(
                "cannot resume a job in status {}",
                job.status
            )));
        }
        self.store
            .transition_job(job_id, JobStatus::Running, None)
            .await
    }

    pub async fn skip_preview(&self, job_id: Uuid) -> Result<Job> {
        let job = self.store.get_job(job_id).await?;
        if job.status != JobStatus::Previewing {
            return Err(ServiceError::conflict(format!(
                "cannot skip preview of a job in status {}",
                job.status
            )));
        }
        self.store
            .transition_job(
                job_id,
                JobStatus::Running,
                Some("skipped preview".to_string()),
            )
            .await
    }

    /// Cancel a job. Idempotent: canceling a canceled job is a no-op.
    pub async fn cancel_job(&self, job_id: Uuid, message: Option<String>) -> Result<Job> {
        let before = self.store.get_job(job_id).await?;
        if before.status == JobStatus::Canceled {
            return Ok(before);
        }
        let job = self
            .store
            .transition_job(job_id, JobStatus::Canceled, message)
            .await?;
        self.signals.publish(job_id, JobStatus::Canceled);
        Ok(job)
    }

    pub async fn add_labels(&self, job_ids: &[Uuid], labels: Vec<String>) -> Result<Vec<String>> {
        let normalized = stratus_core::normalize_labels(labels);
        if normalized.is_empty() {
            return Err(ServiceError::validation("no labels provided"));
        }
        self.store.add_labels(job_ids, &normalized).await?;
        Ok(normalized)
    }

    pub async fn remove_labels(&self, job_ids: &[Uuid], labels: Vec<String>) -> Result<()> {
        let normalized = stratus_core::normalize_labels(labels);
        self.store.remove_labels(job_ids, &normalized).await
    }

    /// Block until the job reaches a terminal state, returning it.
    ///
    /// The completion signal fires at most once per job, so this also
    /// polls the store as a fallback (and for callers that subscribe
    /// after the signal fired).
    pub async fn wait_for_terminal(&self, job_id: Uuid) -> Result<Job> {
        let mut rx = self.signals.subscribe(job_id);
        let poll = Duration::from_millis(self.config.sync_request_poll_interval_ms);

        loop {
            let job = self.store.get_job(job_id).await?;
            if job.status.is_terminal() {
                self.signals.discard(job_id);
                return Ok(job);
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Publisher dropped the channel; fall back to polling.
                        tokio::time::sleep(poll).await;
                    }
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

/// Output links appended to the job when final-step items complete. The
/// core treats worker results as opaque artifacts, so each result URI
/// becomes one data link.
fn output_links(results: &[String]) -> Vec<JobLink> {
    results
        .iter()
        .map(|href| JobLink {
            href: href.clone(),
            rel: "data".to_string(),
            mime_type: Some("application/json".to_string()),
            title: None,
            bbox: None,
            temporal: None,
        })
        .collect()
}

