//! Fair-queueing and pool semantics, exercised against the in-memory
//! store (identical semantics to the PostgreSQL implementation).

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use stratus_core::{Job, JobStatus, StepOperation, WorkItemStatus, WorkflowStep};
use stratus_storage::{FailureUpdate, JobPlan, LeasePolicy, MemStore, Store};

const SERVICE_X: &str = "svc/subsetter:latest";

fn policy() -> LeasePolicy {
    LeasePolicy {
        visibility_timeout: Duration::from_secs(3600),
        sync_priority_across_owners: false,
    }
}

fn job(username: &str, is_synchronous: bool, updated_at: DateTime<Utc>) -> Job {
    Job {
        job_id: Uuid::now_v7(),
        username: username.to_string(),
        status: JobStatus::Running,
        progress: 0,
        message: String::new(),
        request: format!("https://stratus.example.com/{username}/req"),
        num_input_granules: 1,
        ignore_errors: false,
        is_synchronous,
        labels: vec![],
        collection_ids: vec!["C1-PROV".to_string()],
        destination_url: None,
        created_at: updated_at,
        updated_at,
    }
}

fn one_step_plan(job: Job) -> JobPlan {
    let step = WorkflowStep {
        job_id: job.job_id,
        step_index: 1,
        service_image: SERVICE_X.to_string(),
        operation: json!({}),
        work_item_count: 1,
        completed_item_count: 0,
        failed_item_count: 0,
        progress_weight: 1.0,
        is_sequential: false,
        has_aggregated_output: false,
        operations: vec![StepOperation::SpatialSubset],
    };
    JobPlan {
        first_item_location: format!("mem://jobs/{}/query0.json", job.job_id),
        job,
        steps: vec![step],
    }
}

fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).unwrap()
}

/// Scenario: three owners, no items running. Leases drain owners in
/// fair order, with the synchronous job beating its owner's async job.
#[tokio::test]
async fn fair_queueing_with_no_items_running() {
    let store = MemStore::new();

    // Creation order fixes the stable tie-break between A and B.
    let a = store.create_job(one_step_plan(job("alice", false, ts(12345)))).await.unwrap();
    let b = store.create_job(one_step_plan(job("bill", false, ts(12345)))).await.unwrap();
    let b_sync = store.create_job(one_step_plan(job("bill", true, ts(12346)))).await.unwrap();
    let c = store.create_job(one_step_plan(job("carol", false, ts(12347)))).await.unwrap();

    // create_job stamps updated_at from the plan, but pin explicitly for clarity
    for (job, at) in [(&a, 12345), (&b, 12345), (&b_sync, 12346), (&c, 12347)] {
        store.set_job_updated_at(job.job_id, ts(at));
    }

    let mut leased_jobs = Vec::new();
    for _ in 0..4 {
        let work = store.lease_work_item(SERVICE_X, &policy()).await.unwrap().unwrap();
        leased_jobs.push(work.item.job_id);
    }

    assert_eq!(
        leased_jobs,
        vec![a.job_id, b_sync.job_id, c.job_id, b.job_id],
        "expected A, then bill's sync job, then C, then bill's async job"
    );

    // Pool is drained: further leases return none.
    assert!(store.lease_work_item(SERVICE_X, &policy()).await.unwrap().is_none());
    assert!(store.lease_work_item(SERVICE_X, &policy()).await.unwrap().is_none());
}

/// Scenario: an owner with items already in flight yields to one with
/// none, regardless of job age.
#[tokio::test]
async fn owners_with_fewer_running_items_win() {
    let store = MemStore::new();

    // Joe's jobs are older, but he accumulates running items.
    let joe1 = store.create_job(one_step_plan(job("joe", false, ts(100)))).await.unwrap();
    let joe2 = store.create_job(one_step_plan(job("joe", false, ts(101)))).await.unwrap();
    let joe3 = store.create_job(one_step_plan(job("joe", false, ts(102)))).await.unwrap();
    let joe4 = store.create_job(one_step_plan(job("joe", false, ts(103)))).await.unwrap();
    let bill = store.create_job(one_step_plan(job("bill", false, ts(999)))).await.unwrap();
    for (j, at) in [(&joe1, 100), (&joe2, 101), (&joe3, 102), (&joe4, 103), (&bill, 999)] {
        store.set_job_updated_at(j.job_id, ts(at));
    }

    // With counts level, Joe's older job wins the first lease.
    let first = store.lease_work_item(SERVICE_X, &policy()).await.unwrap().unwrap();
    assert_eq!(first.item.job_id, joe1.job_id);

    // Joe now has 1 running; Bill has 0, so Bill is served next even
    // though his job is far newer.
    let second = store.lease_work_item(SERVICE_X, &policy()).await.unwrap().unwrap();
    assert_eq!(second.item.job_id, bill.job_id);

    // Bill has no more ready items; Joe is selected again.
    let third = store.lease_work_item(SERVICE_X, &policy()).await.unwrap().unwrap();
    assert_eq!(third.item.job_id, joe2.job_id);
}

/// The cross-owner knob serves synchronous work first system-wide.
#[tokio::test]
async fn cross_owner_sync_priority_is_a_knob() {
    let store = MemStore::new();
    let async_old = store.create_job(one_step_plan(job("alice", false, ts(100)))).await.unwrap();
    let sync_new = store.create_job(one_step_plan(job("bill", true, ts(200)))).await.unwrap();
    store.set_job_updated_at(async_old.job_id, ts(100));
    store.set_job_updated_at(sync_new.job_id, ts(200));

    let cross_owner = LeasePolicy {
        sync_priority_across_owners: true,
        ..policy()
    };
    let first = store.lease_work_item(SERVICE_X, &cross_owner).await.unwrap().unwrap();
    assert_eq!(first.item.job_id, sync_new.job_id);
}

#[tokio::test]
async fn paused_jobs_are_invisible_to_the_dispatcher() {
    let store = MemStore::new();
    let job = store.create_job(one_step_plan(job("alice", false, ts(100)))).await.unwrap();

    store.transition_job(job.job_id, JobStatus::Paused, None).await.unwrap();
    assert!(store.lease_work_item(SERVICE_X, &policy()).await.unwrap().is_none());

    store.transition_job(job.job_id, JobStatus::Running, None).await.unwrap();
    let work = store.lease_work_item(SERVICE_X, &policy()).await.unwrap().unwrap();
    assert_eq!(work.item.job_id, job.job_id);
}

#[tokio::test]
async fn lease_maintains_the_user_work_ledger() {
    let store = MemStore::new();
    let job = store.create_job(one_step_plan(job("alice", false, ts(100)))).await.unwrap();

    let before = store.get_user_work("alice", SERVICE_X).await.unwrap().unwrap();
    assert_eq!((before.ready_count, before.running_count), (1, 0));
    assert_eq!(before.last_worked_at, DateTime::<Utc>::UNIX_EPOCH);

    let work = store.lease_work_item(SERVICE_X, &policy()).await.unwrap().unwrap();
    assert_eq!(work.item.job_id, job.job_id);
    assert_eq!(work.item.status, WorkItemStatus::Running);
    assert!(work.item.leased_until.is_some());

    let after = store.get_user_work("alice", SERVICE_X).await.unwrap().unwrap();
    assert_eq!((after.ready_count, after.running_count), (0, 1));
    assert!(after.last_worked_at > DateTime::<Utc>::UNIX_EPOCH);
}

/// No item is ever handed to two concurrent lease calls.
#[tokio::test]
async fn concurrent_leases_never_share_an_item() {
    use std::sync::Arc;

    let store = Arc::new(MemStore::new());
    for i in 0..8 {
        store
            .create_job(one_step_plan(job(&format!("user{i}"), false, ts(100 + i))))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.lease_work_item(SERVICE_X, &policy()).await.unwrap()
        }));
    }

    let mut seen = std::collections::HashSet::new();
    let mut leased = 0;
    for handle in handles {
        if let Some(work) = handle.await.unwrap() {
            assert!(seen.insert(work.item.id), "item leased twice");
            leased += 1;
        }
    }
    assert_eq!(leased, 8);
}

/// Requeue on expiry honors the retry limit; exhausted items are
/// reported for the failure path.
#[tokio::test]
async fn expired_leases_requeue_until_retries_run_out() {
    let store = MemStore::new();
    store.create_job(one_step_plan(job("alice", false, ts(100)))).await.unwrap();

    let short = LeasePolicy {
        visibility_timeout: Duration::from_secs(0),
        ..policy()
    };

    // First expiry: requeued with retry_count 1.
    let work = store.lease_work_item(SERVICE_X, &short).await.unwrap().unwrap();
    let sweep = store
        .expire_leases(Utc::now() + chrono::Duration::seconds(1), 1)
        .await
        .unwrap();
    assert_eq!(sweep.requeued, vec![work.item.id]);
    assert!(sweep.exhausted.is_empty());
    let item = store.get_work_item(work.item.id).await.unwrap();
    assert_eq!(item.status, WorkItemStatus::Ready);
    assert_eq!(item.retry_count, 1);

    // Second expiry: budget exhausted.
    let work = store.lease_work_item(SERVICE_X, &short).await.unwrap().unwrap();
    let sweep = store
        .expire_leases(Utc::now() + chrono::Duration::seconds(1), 1)
        .await
        .unwrap();
    assert!(sweep.requeued.is_empty());
    assert_eq!(sweep.exhausted, vec![work.item.id]);

    // Routing the exhausted item through the failure path fails the job.
    let outcome = store
        .apply_failure(FailureUpdate {
            item_id: work.item.id,
            message: "work item exceeded lease timeout".to_string(),
            retry_limit: 1,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, stratus_storage::FailureOutcome::JobFailed));
}

/// Sequential steps serve one item at a time, in sort order.
#[tokio::test]
async fn sequential_steps_dispatch_one_item_at_a_time() {
    use stratus_storage::CompletionUpdate;

    const SEQ_IMAGE: &str = "svc/mosaic:latest";

    let store = MemStore::new();
    let mut plan = one_step_plan(job("alice", false, ts(100)));
    plan.steps.push(WorkflowStep {
        job_id: plan.job.job_id,
        step_index: 2,
        service_image: SEQ_IMAGE.to_string(),
        operation: json!({}),
        work_item_count: 0,
        completed_item_count: 0,
        failed_item_count: 0,
        progress_weight: 0.5,
        is_sequential: true,
        has_aggregated_output: false,
        operations: vec![StepOperation::Concatenate],
    });
    plan.steps[0].progress_weight = 0.5;
    let job = store.create_job(plan).await.unwrap();

    // Finish the seed item, fanning out two items for the sequential step.
    let seed = store.lease_work_item(SERVICE_X, &policy()).await.unwrap().unwrap();
    store
        .apply_completion(CompletionUpdate {
            item_id: seed.item.id,
            status: WorkItemStatus::Successful,
            result_uris: vec!["mem://r/cat0.json".into(), "mem://r/cat1.json".into()],
            output_item_sizes: vec![1, 1],
            next_item_locations: vec!["mem://r/cat0.json".into(), "mem://r/cat1.json".into()],
            links: vec![],
        })
        .await
        .unwrap();

    // Only the lowest-sort item of the sequential step is leasable, and
    // only while no sibling is in flight.
    let first = store.lease_work_item(SEQ_IMAGE, &policy()).await.unwrap().unwrap();
    assert_eq!(first.item.job_id, job.job_id);
    assert_eq!(first.item.sort_index, 0);
    assert!(store.lease_work_item(SEQ_IMAGE, &policy()).await.unwrap().is_none());

    // Completing it unblocks the next item in sort order.
    store
        .apply_completion(CompletionUpdate {
            item_id: first.item.id,
            status: WorkItemStatus::Successful,
            result_uris: vec!["mem://r/out0.json".into()],
            output_item_sizes: vec![1],
            next_item_locations: vec![],
            links: vec![],
        })
        .await
        .unwrap();
    let second = store.lease_work_item(SEQ_IMAGE, &policy()).await.unwrap().unwrap();
    assert_eq!(second.item.sort_index, 1);
}
