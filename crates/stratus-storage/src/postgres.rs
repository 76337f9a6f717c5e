//! PostgreSQL implementation of the store
//!
//! Every operation is one transaction. Per-job serialisation comes from
//! `SELECT … FOR UPDATE` on the job row; lease selection uses
//! `FOR UPDATE SKIP LOCKED` so concurrent dispatchers never hand out the
//! same item. Lock order is always job row first, then item rows.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use stratus_core::{
    Job, JobLink, JobStatus, Result, ServiceError, UserWork, WorkItem, WorkItemStatus,
    WorkflowStep,
};

use crate::models::{JobLinkRow, JobRow, WorkItemRow, WorkflowStepRow};
use crate::store::*;

/// Job statuses whose items the dispatcher may lease
const DISPATCHABLE_STATUSES: [&str; 3] = ["running", "running_with_errors", "previewing"];

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a store over an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run pending migrations
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await.map_err(db_err)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| ServiceError::server(format!("migrations failed: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn labels_for(&self, job_id: Uuid) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT l.value
            FROM raw_labels l
            JOIN jobs_raw_labels jl ON jl.label_id = l.id
            WHERE jl.job_id = $1
            ORDER BY l.value
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|r| r.get("value")).collect())
    }
}

fn db_err(e: sqlx::Error) -> ServiceError {
    error!("database error: {}", e);
    ServiceError::server(e.to_string())
}

/// Lock and load a job row inside a transaction.
async fn lock_job(tx: &mut Transaction<'_, Postgres>, job_id: Uuid) -> Result<JobRow> {
    sqlx::query_as::<_, JobRow>(
        r#"
        SELECT job_id, username, status, progress, message, request,
               num_input_granules, ignore_errors, is_synchronous,
               destination_url, collection_ids, created_at, updated_at
        FROM jobs
        WHERE job_id = $1
        FOR UPDATE
        "#,
    )
    .bind(job_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?
    .ok_or_else(|| ServiceError::job_not_found(job_id))
}

/// Lock and load a work item row inside a transaction.
async fn lock_item(tx: &mut Transaction<'_, Postgres>, id: i64) -> Result<WorkItemRow> {
    sqlx::query_as::<_, WorkItemRow>(
        r#"
        SELECT id, job_id, step_index, service_image, status, retry_count,
               stac_catalog_location, result_uris, output_item_sizes,
               sort_index, started_at, leased_until, created_at, updated_at
        FROM work_items
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?
    .ok_or_else(|| ServiceError::item_not_found(id))
}

async fn load_steps(tx: &mut Transaction<'_, Postgres>, job_id: Uuid) -> Result<Vec<WorkflowStep>> {
    let rows = sqlx::query_as::<_, WorkflowStepRow>(
        r#"
        SELECT job_id, step_index, service_image, operation,
               work_item_count, completed_item_count, failed_item_count,
               progress_weight, is_sequential, has_aggregated_output, operations
        FROM workflow_steps
        WHERE job_id = $1
        ORDER BY step_index
        "#,
    )
    .bind(job_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(db_err)?;
    rows.into_iter().map(WorkflowStepRow::into_step).collect()
}

async fn set_item_terminal(
    tx: &mut Transaction<'_, Postgres>,
    id: i64,
    status: WorkItemStatus,
    result_uris: &[String],
    output_item_sizes: &[i64],
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE work_items
        SET status = $2,
            result_uris = $3,
            output_item_sizes = $4,
            leased_until = NULL,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status.to_string())
    .bind(serde_json::json!(result_uris))
    .bind(serde_json::json!(output_item_sizes))
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Adjust a user-work row, creating it on first touch.
async fn bump_user_work(
    tx: &mut Transaction<'_, Postgres>,
    username: &str,
    service_image: &str,
    ready_delta: i32,
    running_delta: i32,
    touch_last_worked: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO user_work (username, service_image, ready_count, running_count, last_worked_at)
        VALUES ($1, $2, GREATEST($3, 0), GREATEST($4, 0),
                CASE WHEN $5 THEN NOW() ELSE 'epoch'::timestamptz END)
        ON CONFLICT (username, service_image) DO UPDATE
        SET ready_count = GREATEST(user_work.ready_count + $3, 0),
            running_count = GREATEST(user_work.running_count + $4, 0),
            last_worked_at = CASE WHEN $5 THEN NOW() ELSE user_work.last_worked_at END
        "#,
    )
    .bind(username)
    .bind(service_image)
    .bind(ready_delta)
    .bind(running_delta)
    .bind(touch_last_worked)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Cancel every non-terminal item of a job, keeping user_work consistent.
async fn cancel_job_items(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    username: &str,
) -> Result<()> {
    // Two statements: RETURNING cannot see the pre-update status, and the
    // user_work deltas depend on it.
    let rows = sqlx::query(
        r#"
        SELECT service_image, status FROM work_items
        WHERE job_id = $1 AND status IN ('ready', 'queued', 'running')
        FOR UPDATE
        "#,
    )
    .bind(job_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(db_err)?;

    let mut ready_deltas: HashMap<String, i32> = HashMap::new();
    let mut running_deltas: HashMap<String, i32> = HashMap::new();
    for row in &rows {
        let image: String = row.get("service_image");
        let status: String = row.get("status");
        if status == "ready" {
            *ready_deltas.entry(image).or_default() -= 1;
        } else {
            *running_deltas.entry(image).or_default() -= 1;
        }
    }

    sqlx::query(
        r#"
        UPDATE work_items
        SET status = 'canceled', leased_until = NULL, updated_at = NOW()
        WHERE job_id = $1 AND status IN ('ready', 'queued', 'running')
        "#,
    )
    .bind(job_id)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    let images: std::collections::HashSet<&String> =
        ready_deltas.keys().chain(running_deltas.keys()).collect();
    for image in images {
        let ready = ready_deltas.get(image).copied().unwrap_or(0);
        let running = running_deltas.get(image).copied().unwrap_or(0);
        bump_user_work(tx, username, image, ready, running, false).await?;
    }
    Ok(())
}

async fn set_job_progress_status(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    status: JobStatus,
    progress: i32,
    message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2,
            progress = $3,
            message = COALESCE($4, message),
            updated_at = NOW()
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(status.to_string())
    .bind(progress)
    .bind(message)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn insert_job_error(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    url: &str,
    message: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO job_errors (job_id, url, message)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(job_id)
    .bind(url)
    .bind(Job::truncate_message(message))
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Insert ready items for a step, extending its item count and the
/// owner's ready count. Sort indexes continue from the step's current
/// item count.
async fn insert_step_items(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    step: &WorkflowStep,
    username: &str,
    locations: &[String],
) -> Result<()> {
    for (offset, location) in locations.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO work_items
                (job_id, step_index, service_image, status, stac_catalog_location, sort_index)
            VALUES ($1, $2, $3, 'ready', $4, $5)
            "#,
        )
        .bind(job_id)
        .bind(step.step_index)
        .bind(&step.service_image)
        .bind(location)
        .bind(step.work_item_count + offset as i32)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    }

    sqlx::query(
        r#"
        UPDATE workflow_steps
        SET work_item_count = work_item_count + $3
        WHERE job_id = $1 AND step_index = $2
        "#,
    )
    .bind(job_id)
    .bind(step.step_index)
    .bind(locations.len() as i32)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    bump_user_work(tx, username, &step.service_image, locations.len() as i32, 0, false).await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip(self, plan), fields(job_id = %plan.job.job_id))]
    async fn create_job(&self, plan: JobPlan) -> Result<Job> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let job = &plan.job;

        sqlx::query(
            r#"
            INSERT INTO jobs
                (job_id, username, status, progress, message, request,
                 num_input_granules, ignore_errors, is_synchronous,
                 destination_url, collection_ids, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.job_id)
        .bind(&job.username)
        .bind(job.status.to_string())
        .bind(job.progress)
        .bind(&job.message)
        .bind(&job.request)
        .bind(job.num_input_granules)
        .bind(job.ignore_errors)
        .bind(job.is_synchronous)
        .bind(&job.destination_url)
        .bind(serde_json::json!(job.collection_ids))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for step in &plan.steps {
            sqlx::query(
                r#"
                INSERT INTO workflow_steps
                    (job_id, step_index, service_image, operation, work_item_count,
                     completed_item_count, failed_item_count, progress_weight,
                     is_sequential, has_aggregated_output, operations)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(step.job_id)
            .bind(step.step_index)
            .bind(&step.service_image)
            .bind(&step.operation)
            .bind(step.work_item_count)
            .bind(step.completed_item_count)
            .bind(step.failed_item_count)
            .bind(step.progress_weight)
            .bind(step.is_sequential)
            .bind(step.has_aggregated_output)
            .bind(serde_json::to_value(&step.operations).map_err(|e| ServiceError::server(e.to_string()))?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let first_step = plan
            .steps
            .first()
            .ok_or_else(|| ServiceError::server("job plan has no steps"))?;
        sqlx::query(
            r#"
            INSERT INTO work_items
                (job_id, step_index, service_image, status, stac_catalog_location, sort_index)
            VALUES ($1, 1, $2, 'ready', $3, 0)
            "#,
        )
        .bind(job.job_id)
        .bind(&first_step.service_image)
        .bind(&plan.first_item_location)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        bump_user_work(&mut tx, &job.username, &first_step.service_image, 1, 0, false).await?;

        for label in &job.labels {
            let label_id: i64 = sqlx::query(
                r#"
                INSERT INTO raw_labels (value) VALUES ($1)
                ON CONFLICT (value) DO UPDATE SET value = EXCLUDED.value
                RETURNING id
                "#,
            )
            .bind(label)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
            .get("id");

            sqlx::query(
                r#"
                INSERT INTO jobs_raw_labels (job_id, label_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(job.job_id)
            .bind(label_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(job_id = %job.job_id, steps = plan.steps.len(), "created job");
        Ok(plan.job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT job_id, username, status, progress, message, request,
                   num_input_granules, ignore_errors, is_synchronous,
                   destination_url, collection_ids, created_at, updated_at
            FROM jobs
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ServiceError::job_not_found(job_id))?;

        let labels = self.labels_for(job_id).await?;
        row.into_job(labels)
    }

    async fn list_steps(&self, job_id: Uuid) -> Result<Vec<WorkflowStep>> {
        let rows = sqlx::query_as::<_, WorkflowStepRow>(
            r#"
            SELECT job_id, step_index, service_image, operation,
                   work_item_count, completed_item_count, failed_item_count,
                   progress_weight, is_sequential, has_aggregated_output, operations
            FROM workflow_steps
            WHERE job_id = $1
            ORDER BY step_index
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(WorkflowStepRow::into_step).collect()
    }

    async fn get_work_item(&self, id: i64) -> Result<WorkItem> {
        sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT id, job_id, step_index, service_image, status, retry_count,
                   stac_catalog_location, result_uris, output_item_sizes,
                   sort_index, started_at, leased_until, created_at, updated_at
            FROM work_items
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ServiceError::item_not_found(id))?
        .into_item()
    }

    async fn get_user_work(
        &self,
        username: &str,
        service_image: &str,
    ) -> Result<Option<UserWork>> {
        let row = sqlx::query(
            r#"
            SELECT username, service_image, ready_count, running_count, last_worked_at
            FROM user_work
            WHERE username = $1 AND service_image = $2
            "#,
        )
        .bind(username)
        .bind(service_image)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| UserWork {
            username: r.get("username"),
            service_image: r.get("service_image"),
            ready_count: r.get("ready_count"),
            running_count: r.get("running_count"),
            last_worked_at: r.get("last_worked_at"),
        }))
    }

    async fn list_job_links(&self, job_id: Uuid) -> Result<Vec<JobLink>> {
        let rows = sqlx::query_as::<_, JobLinkRow>(
            r#"
            SELECT href, rel, mime_type, title, bbox, temporal
            FROM job_links
            WHERE job_id = $1
            ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(JobLinkRow::into_link).collect()
    }

    async fn list_job_errors(&self, job_id: Uuid) -> Result<Vec<JobError>> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, url, message, created_at
            FROM job_errors
            WHERE job_id = $1
            ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|r| JobError {
                job_id: r.get("job_id"),
                url: r.get("url"),
                message: r.get("message"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn list_successful_results(
        &self,
        job_id: Uuid,
        step_index: i32,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT result_uris
            FROM work_items
            WHERE job_id = $1 AND step_index = $2 AND status IN ('successful', 'warning')
            ORDER BY sort_index
            "#,
        )
        .bind(job_id)
        .bind(step_index)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            let uris: Vec<String> = serde_json::from_value(row.get("result_uris"))
                .map_err(|e| ServiceError::server(format!("result_uris decode: {e}")))?;
            out.extend(uris);
        }
        Ok(out)
    }

    #[instrument(skip(self, policy))]
    async fn lease_work_item(
        &self,
        service_image: &str,
        policy: &LeasePolicy,
    ) -> Result<Option<LeasedWork>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let leased_until =
            Utc::now() + chrono::Duration::from_std(policy.visibility_timeout).unwrap_or_default();

        // Owner first (fewest in flight, longest neglected), then job
        // (sync preference, oldest), then item (step, sort). The final
        // SKIP LOCKED re-check makes concurrent leases safe: a snatched
        // candidate simply yields no row.
        let owner_sync_key = if policy.sync_priority_across_owners {
            "MAX((r.is_synchronous)::int) DESC,"
        } else {
            ""
        };
        let sql = format!(
            r#"
            WITH ready_items AS (
                SELECT w.id, w.job_id, w.step_index, w.sort_index,
                       j.username, j.is_synchronous, j.updated_at AS job_updated_at
                FROM work_items w
                JOIN jobs j ON j.job_id = w.job_id
                JOIN workflow_steps s ON s.job_id = w.job_id AND s.step_index = w.step_index
                WHERE w.service_image = $1
                  AND w.status = 'ready'
                  AND j.status = ANY($2)
                  AND (NOT s.is_sequential OR (
                        NOT EXISTS (
                            SELECT 1 FROM work_items b
                            WHERE b.job_id = w.job_id AND b.step_index = w.step_index
                              AND b.status IN ('queued', 'running'))
                        AND w.sort_index = (
                            SELECT MIN(c.sort_index) FROM work_items c
                            WHERE c.job_id = w.job_id AND c.step_index = w.step_index
                              AND c.status = 'ready')))
            ),
            chosen_owner AS (
                SELECT r.username
                FROM ready_items r
                LEFT JOIN user_work uw
                  ON uw.username = r.username AND uw.service_image = $1
                GROUP BY r.username, uw.running_count, uw.last_worked_at
                ORDER BY {owner_sync_key}
                         COALESCE(uw.running_count, 0) ASC,
                         COALESCE(uw.last_worked_at, 'epoch'::timestamptz) ASC,
                         MIN(r.id) ASC
                LIMIT 1
            ),
            chosen_job AS (
                SELECT r.job_id
                FROM ready_items r
                JOIN chosen_owner o ON o.username = r.username
                GROUP BY r.job_id, r.is_synchronous, r.job_updated_at
                ORDER BY r.is_synchronous DESC, r.job_updated_at ASC, MIN(r.id) ASC
                LIMIT 1
            ),
            chosen_item AS (
                SELECT r.id
                FROM ready_items r
                JOIN chosen_job cj ON cj.job_id = r.job_id
                ORDER BY r.step_index ASC, r.sort_index ASC
                LIMIT 1
            ),
            locked AS (
                SELECT id FROM work_items
                WHERE id IN (SELECT id FROM chosen_item) AND status = 'ready'
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_items w
            SET status = 'running',
                started_at = NOW(),
                leased_until = $3,
                updated_at = NOW()
            FROM locked
            WHERE w.id = locked.id
            RETURNING w.id, w.job_id, w.step_index, w.service_image, w.status,
                      w.retry_count, w.stac_catalog_location, w.result_uris,
                      w.output_item_sizes, w.sort_index, w.started_at,
                      w.leased_until, w.created_at, w.updated_at
            "#
        );

        let row = sqlx::query_as::<_, WorkItemRow>(&sql)
            .bind(service_image)
            .bind(&DISPATCHABLE_STATUSES[..])
            .bind(leased_until)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let item = row.into_item()?;

        let ctx = sqlx::query(
            r#"
            SELECT s.operation, j.num_input_granules, j.username
            FROM workflow_steps s
            JOIN jobs j ON j.job_id = s.job_id
            WHERE s.job_id = $1 AND s.step_index = $2
            "#,
        )
        .bind(item.job_id)
        .bind(item.step_index)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let username: String = ctx.get("username");
        bump_user_work(&mut tx, &username, service_image, -1, 1, true).await?;

        tx.commit().await.map_err(db_err)?;
        debug!(item_id = item.id, job_id = %item.job_id, "leased work item");

        Ok(Some(LeasedWork {
            operation: ctx.get("operation"),
            num_input_granules: ctx.get("num_input_granules"),
            item,
        }))
    }

    async fn load_item_context(&self, id: i64) -> Result<ItemContext> {
        let item = self.get_work_item(id).await?;
        let job = self.get_job(item.job_id).await?;
        let steps = self.list_steps(item.job_id).await?;
        let step = steps
            .iter()
            .find(|s| s.step_index == item.step_index)
            .cloned()
            .ok_or_else(|| {
                ServiceError::server(format!(
                    "work item {id} references missing step {}",
                    item.step_index
                ))
            })?;
        let next_step = steps
            .iter()
            .find(|s| s.step_index == item.step_index + 1)
            .cloned();
        Ok(ItemContext {
            item,
            job,
            step,
            next_step,
        })
    }

    #[instrument(skip(self, update), fields(item_id = update.item_id))]
    async fn apply_completion(&self, update: CompletionUpdate) -> Result<CompletionOutcome> {
        if !update.status.is_successful() {
            return Err(ServiceError::server(
                "apply_completion requires a successful outcome",
            ));
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let job_id: Uuid = sqlx::query("SELECT job_id FROM work_items WHERE id = $1")
            .bind(update.item_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| ServiceError::item_not_found(update.item_id))?
            .get("job_id");

        let job_row = lock_job(&mut tx, job_id).await?;
        let job_status: JobStatus = job_row.status.parse()?;
        let item_row = lock_item(&mut tx, update.item_id).await?;
        let item_status: WorkItemStatus = item_row.status.parse()?;

        if job_status == JobStatus::Canceled {
            // Reports racing a cancel are accepted and coerced; an item
            // the cascade already canceled needs no further change.
            match item_status {
                WorkItemStatus::Canceled => {}
                s if s.is_terminal() => {
                    return Err(ServiceError::conflict("work item is already terminal"));
                }
                _ => {
                    set_item_terminal(&mut tx, update.item_id, WorkItemStatus::Canceled, &[], &[])
                        .await?;
                    bump_user_work(
                        &mut tx,
                        &job_row.username,
                        &item_row.service_image,
                        0,
                        -1,
                        false,
                    )
                    .await?;
                }
            }
            tx.commit().await.map_err(db_err)?;
            return Ok(CompletionOutcome {
                job_status: JobStatus::Canceled,
                job_terminal: true,
                aggregation_ready: false,
                coerced_to_canceled: true,
            });
        }
        if job_status.is_terminal() {
            return Err(ServiceError::conflict(format!(
                "job is already {job_status}"
            )));
        }
        if item_status.is_terminal() {
            return Err(ServiceError::conflict("work item is already terminal"));
        }
        if !matches!(item_status, WorkItemStatus::Running | WorkItemStatus::Queued) {
            return Err(ServiceError::conflict(format!(
                "work item is {item_status}, not leased"
            )));
        }

        set_item_terminal(
            &mut tx,
            update.item_id,
            update.status,
            &update.result_uris,
            &update.output_item_sizes,
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET completed_item_count = completed_item_count + 1
            WHERE job_id = $1 AND step_index = $2
            "#,
        )
        .bind(job_id)
        .bind(item_row.step_index)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let steps = load_steps(&mut tx, job_id).await?;
        let step = steps
            .iter()
            .find(|s| s.step_index == item_row.step_index)
            .ok_or_else(|| ServiceError::server("step disappeared mid-transaction"))?;
        let next_step = steps.iter().find(|s| s.step_index == item_row.step_index + 1);

        let mut aggregation_ready = false;
        match next_step {
            Some(next) if !next.has_aggregated_output => {
                if !update.next_item_locations.is_empty() {
                    insert_step_items(
                        &mut tx,
                        job_id,
                        next,
                        &job_row.username,
                        &update.next_item_locations,
                    )
                    .await?;
                }
            }
            Some(next) if next.has_aggregated_output => {
                // Only the report that completes the step triggers the
                // aggregate; completions are serialised by the job lock.
                aggregation_ready =
                    step.is_complete() && step.completed_item_count > 0 && next.work_item_count == 0;
            }
            _ => {
                for link in &update.links {
                    sqlx::query(
                        r#"
                        INSERT INTO job_links (job_id, href, rel, mime_type, title, bbox, temporal)
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        "#,
                    )
                    .bind(job_id)
                    .bind(&link.href)
                    .bind(&link.rel)
                    .bind(&link.mime_type)
                    .bind(&link.title)
                    .bind(link.bbox.map(|b| serde_json::json!(b)))
                    .bind(
                        link.temporal
                            .as_ref()
                            .map(serde_json::to_value)
                            .transpose()
                            .map_err(|e| ServiceError::server(e.to_string()))?,
                    )
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                }
            }
        }

        bump_user_work(&mut tx, &job_row.username, &item_row.service_image, 0, -1, false).await?;

        // Reload counters: the fan-out above may have grown the next step.
        let steps = load_steps(&mut tx, job_id).await?;
        let all_complete = steps.iter().all(|s| s.is_complete()) && !aggregation_ready;

        let (new_status, progress) = if all_complete {
            let status = final_status(&steps);
            Job::validate_transition(job_status, status)?;
            (status, 100)
        } else {
            (job_status, computed_progress(&steps, job_row.progress))
        };

        set_job_progress_status(&mut tx, job_id, new_status, progress, None).await?;
        tx.commit().await.map_err(db_err)?;

        debug!(
            item_id = update.item_id,
            %job_id,
            status = %new_status,
            progress,
            "applied work item completion"
        );

        Ok(CompletionOutcome {
            job_status: new_status,
            job_terminal: new_status.is_terminal(),
            aggregation_ready,
            coerced_to_canceled: false,
        })
    }

    #[instrument(skip(self, update), fields(item_id = update.item_id))]
    async fn apply_failure(&self, update: FailureUpdate) -> Result<FailureOutcome> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let job_id: Uuid = sqlx::query("SELECT job_id FROM work_items WHERE id = $1")
            .bind(update.item_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| ServiceError::item_not_found(update.item_id))?
            .get("job_id");

        let job_row = lock_job(&mut tx, job_id).await?;
        let job_status: JobStatus = job_row.status.parse()?;
        let item_row = lock_item(&mut tx, update.item_id).await?;
        let item_status: WorkItemStatus = item_row.status.parse()?;

        if job_status == JobStatus::Canceled {
            match item_status {
                WorkItemStatus::Canceled => {}
                s if s.is_terminal() => {
                    return Err(ServiceError::conflict("work item is already terminal"));
                }
                _ => {
                    set_item_terminal(&mut tx, update.item_id, WorkItemStatus::Canceled, &[], &[])
                        .await?;
                    bump_user_work(
                        &mut tx,
                        &job_row.username,
                        &item_row.service_image,
                        0,
                        -1,
                        false,
                    )
                    .await?;
                }
            }
            tx.commit().await.map_err(db_err)?;
            return Ok(FailureOutcome::CoercedToCanceled);
        }
        if job_status.is_terminal() {
            return Err(ServiceError::conflict(format!(
                "job is already {job_status}"
            )));
        }
        if !matches!(item_status, WorkItemStatus::Running | WorkItemStatus::Queued) {
            return Err(ServiceError::conflict(format!(
                "work item is {item_status}, not leased"
            )));
        }

        // Retry budget remains: back to ready, nothing propagates.
        if item_row.retry_count < update.retry_limit {
            sqlx::query(
                r#"
                UPDATE work_items
                SET status = 'ready',
                    retry_count = retry_count + 1,
                    leased_until = NULL,
                    started_at = NULL,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(update.item_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            bump_user_work(&mut tx, &job_row.username, &item_row.service_image, 1, -1, false)
                .await?;
            tx.commit().await.map_err(db_err)?;
            debug!(item_id = update.item_id, retry = item_row.retry_count + 1, "requeued failed item");
            return Ok(FailureOutcome::Retried {
                retry_count: item_row.retry_count + 1,
            });
        }

        // Permanent failure.
        set_item_terminal(&mut tx, update.item_id, WorkItemStatus::Failed, &[], &[]).await?;
        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET failed_item_count = failed_item_count + 1
            WHERE job_id = $1 AND step_index = $2
            "#,
        )
        .bind(job_id)
        .bind(item_row.step_index)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        insert_job_error(&mut tx, job_id, &item_row.stac_catalog_location, &update.message)
            .await?;
        bump_user_work(&mut tx, &job_row.username, &item_row.service_image, 0, -1, false).await?;

        let steps = load_steps(&mut tx, job_id).await?;
        let step = steps
            .iter()
            .find(|s| s.step_index == item_row.step_index)
            .ok_or_else(|| ServiceError::server("step disappeared mid-transaction"))?;
        let next_step = steps.iter().find(|s| s.step_index == item_row.step_index + 1);

        // A step with no successful output starves everything downstream,
        // so the job cannot finish even under ignore-errors.
        let step_all_failed = step.is_complete() && step.completed_item_count == 0;

        if !job_row.ignore_errors || step_all_failed {
            cancel_job_items(&mut tx, job_id, &job_row.username).await?;
            let message = Job::truncate_message(&update.message);
            set_job_progress_status(
                &mut tx,
                job_id,
                JobStatus::Failed,
                job_row.progress,
                Some(message.as_str()),
            )
            .await?;
            tx.commit().await.map_err(db_err)?;
            debug!(item_id = update.item_id, %job_id, "work item failure failed the job");
            return Ok(FailureOutcome::JobFailed);
        }

        let aggregation_ready = next_step
            .map(|n| n.has_aggregated_output && step.is_complete() && n.work_item_count == 0)
            .unwrap_or(false)
            && step.completed_item_count > 0;

        let all_complete = steps.iter().all(|s| s.is_complete()) && !aggregation_ready;
        let (new_status, progress) = if all_complete {
            let status = final_status(&steps);
            Job::validate_transition(job_status, status)?;
            (status, 100)
        } else {
            // Keep paused jobs paused; an active job shows its errors.
            let status = if matches!(job_status, JobStatus::Running | JobStatus::Previewing) {
                JobStatus::RunningWithErrors
            } else {
                job_status
            };
            (status, computed_progress(&steps, job_row.progress))
        };

        set_job_progress_status(&mut tx, job_id, new_status, progress, None).await?;
        tx.commit().await.map_err(db_err)?;

        Ok(FailureOutcome::ItemFailed {
            job_status: new_status,
            job_terminal: new_status.is_terminal(),
            aggregation_ready,
        })
    }

    #[instrument(skip(self))]
    async fn insert_aggregated_item(
        &self,
        job_id: Uuid,
        step_index: i32,
        catalog_location: &str,
    ) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let job_row = lock_job(&mut tx, job_id).await?;
        let job_status: JobStatus = job_row.status.parse()?;
        if job_status.is_terminal() {
            tx.rollback().await.ok();
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            SELECT service_image, work_item_count
            FROM workflow_steps
            WHERE job_id = $1 AND step_index = $2
            "#,
        )
        .bind(job_id)
        .bind(step_index)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("workflow step {job_id}/{step_index}"))
        })?;

        let work_item_count: i32 = row.get("work_item_count");
        if work_item_count > 0 {
            tx.rollback().await.ok();
            return Ok(None);
        }
        let service_image: String = row.get("service_image");

        let item_id: i64 = sqlx::query(
            r#"
            INSERT INTO work_items
                (job_id, step_index, service_image, status, stac_catalog_location, sort_index)
            VALUES ($1, $2, $3, 'ready', $4, 0)
            RETURNING id
            "#,
        )
        .bind(job_id)
        .bind(step_index)
        .bind(&service_image)
        .bind(catalog_location)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .get("id");

        sqlx::query(
            r#"
            UPDATE workflow_steps SET work_item_count = 1
            WHERE job_id = $1 AND step_index = $2
            "#,
        )
        .bind(job_id)
        .bind(step_index)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        bump_user_work(&mut tx, &job_row.username, &service_image, 1, 0, false).await?;
        tx.commit().await.map_err(db_err)?;

        debug!(%job_id, step_index, item_id, "inserted aggregated work item");
        Ok(Some(item_id))
    }

    #[instrument(skip(self, message))]
    async fn transition_job(
        &self,
        job_id: Uuid,
        to: JobStatus,
        message: Option<String>,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let job_row = lock_job(&mut tx, job_id).await?;
        let from: JobStatus = job_row.status.parse()?;

        // Repeated cancels are no-ops.
        if to == JobStatus::Canceled && from == JobStatus::Canceled {
            tx.rollback().await.ok();
            return self.get_job(job_id).await;
        }

        Job::validate_transition(from, to)?;

        if to == JobStatus::Canceled {
            cancel_job_items(&mut tx, job_id, &job_row.username).await?;
        }

        set_job_progress_status(&mut tx, job_id, to, job_row.progress, message.as_deref())
            .await?;
        tx.commit().await.map_err(db_err)?;

        debug!(%job_id, from = %from, to = %to, "job status transition");
        self.get_job(job_id).await
    }

    async fn add_labels(&self, job_ids: &[Uuid], labels: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let found: i64 = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE job_id = ANY($1)")
            .bind(job_ids)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
            .get("n");
        if found != job_ids.len() as i64 {
            return Err(ServiceError::NotFound("one or more jobs".to_string()));
        }

        for label in labels {
            let label_id: i64 = sqlx::query(
                r#"
                INSERT INTO raw_labels (value) VALUES ($1)
                ON CONFLICT (value) DO UPDATE SET value = EXCLUDED.value
                RETURNING id
                "#,
            )
            .bind(label)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
            .get("id");

            for job_id in job_ids {
                sqlx::query(
                    r#"
                    INSERT INTO jobs_raw_labels (job_id, label_id)
                    VALUES ($1, $2)
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(job_id)
                .bind(label_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)
    }

    async fn remove_labels(&self, job_ids: &[Uuid], labels: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let found: i64 = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE job_id = ANY($1)")
            .bind(job_ids)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
            .get("n");
        if found != job_ids.len() as i64 {
            return Err(ServiceError::NotFound("one or more jobs".to_string()));
        }

        sqlx::query(
            r#"
            DELETE FROM jobs_raw_labels jl
            USING raw_labels l
            WHERE jl.label_id = l.id
              AND jl.job_id = ANY($1)
              AND l.value = ANY($2)
            "#,
        )
        .bind(job_ids)
        .bind(labels)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)
    }

    #[instrument(skip(self))]
    async fn expire_leases(&self, now: DateTime<Utc>, retry_limit: i32) -> Result<ExpiredLeases> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            r#"
            SELECT w.id, w.retry_count, w.service_image, j.username
            FROM work_items w
            JOIN jobs j ON j.job_id = w.job_id
            WHERE w.status = 'running' AND w.leased_until < $1
            ORDER BY w.id
            FOR UPDATE OF w SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut expired = ExpiredLeases::default();
        for row in rows {
            let id: i64 = row.get("id");
            let retry_count: i32 = row.get("retry_count");
            let service_image: String = row.get("service_image");
            let username: String = row.get("username");

            if retry_count < retry_limit {
                sqlx::query(
                    r#"
                    UPDATE work_items
                    SET status = 'ready',
                        retry_count = retry_count + 1,
                        leased_until = NULL,
                        started_at = NULL,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                bump_user_work(&mut tx, &username, &service_image, 1, -1, false).await?;
                expired.requeued.push(id);
            } else {
                expired.exhausted.push(id);
            }
        }

        tx.commit().await.map_err(db_err)?;
        if !expired.requeued.is_empty() || !expired.exhausted.is_empty() {
            debug!(
                requeued = expired.requeued.len(),
                exhausted = expired.exhausted.len(),
                "lease reaper sweep"
            );
        }
        Ok(expired)
    }
}
