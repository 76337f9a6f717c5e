// HTTP surface tests against an in-memory store.
// Run with: cargo test -p stratus-api --test routes_test

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use stratus_api::{router, AppState};
use stratus_core::{
    CollectionInfo, Config, MemoryObjectStore, ObjectStore, ServiceDefinition, ServiceStep,
    StepOperation, TransformationRequest,
};
use stratus_engine::{
    CompletionHub, Dispatcher, ProgressEngine, WorkflowPlanner, QUERY_CMR_IMAGE,
};
use stratus_storage::{MemStore, Store};

const SUBSET_IMAGE: &str = "svc/subsetter:latest";

struct TestApp {
    app: axum::Router,
    planner: WorkflowPlanner,
}

fn test_app() -> TestApp {
    let config = Config::default();
    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
    let hub = Arc::new(CompletionHub::new());

    let planner = WorkflowPlanner::new(store.clone(), objects.clone(), config.clone());
    let engine = Arc::new(ProgressEngine::new(store.clone(), objects, config.clone(), hub));
    let dispatcher = Arc::new(Dispatcher::new(store, config));

    TestApp {
        app: router(AppState { dispatcher, engine }),
        planner,
    }
}

async fn plan_test_job(planner: &WorkflowPlanner) -> stratus_core::Job {
    let request = TransformationRequest {
        request: "https://stratus.example.com/C1-PROV/ogc-api-coverages".to_string(),
        collection_ids: vec!["C1-PROV".to_string()],
        granule_ids: vec![],
        granule_name: None,
        max_results: None,
        ignore_errors: false,
        destination_url: None,
        labels: vec![],
        operation: json!({"format": "image/tiff"}),
    };
    let service = ServiceDefinition {
        name: "tiff-subsetter".to_string(),
        steps: vec![ServiceStep {
            image: SUBSET_IMAGE.to_string(),
            operations: vec![StepOperation::SpatialSubset],
            is_sequential: false,
            has_aggregated_output: false,
            progress_weight: None,
        }],
        capabilities: vec![StepOperation::SpatialSubset],
        granule_limit: None,
        force_async: false,
    };
    let collections = vec![CollectionInfo {
        id: "C1-PROV".to_string(),
        granule_hits: 2,
        granule_limit: None,
        variables: vec![],
    }];
    planner
        .plan_job("alice", request, service, collections)
        .await
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let t = test_app();
    let response = t
        .app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn work_poll_leases_and_then_404s_when_drained() {
    let t = test_app();
    plan_test_job(&t.planner).await;

    let response = t
        .app
        .clone()
        .oneshot(
            Request::get(format!("/work?serviceID={QUERY_CMR_IMAGE}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["workItem"]["serviceImage"], QUERY_CMR_IMAGE);
    assert_eq!(body["workItem"]["status"], "running");
    assert_eq!(body["maxCmrGranules"], json!(2));
    assert_eq!(body["operation"]["format"], "image/tiff");

    // Only one item was seeded.
    let response = t
        .app
        .oneshot(
            Request::get(format!("/work?serviceID={QUERY_CMR_IMAGE}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn work_report_round_trip_and_conflict_on_duplicate() {
    let t = test_app();
    plan_test_job(&t.planner).await;

    let response = t
        .app
        .clone()
        .oneshot(
            Request::get(format!("/work?serviceID={QUERY_CMR_IMAGE}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let item_id = body_json(response).await["workItem"]["id"].as_i64().unwrap();

    let report = json!({
        "status": "successful",
        "results": ["mem://granules/catalog0.json"],
        "outputItemSizes": [123]
    });
    let response = t
        .app
        .clone()
        .oneshot(json_request("PUT", &format!("/work/{item_id}"), report.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // The fan-out produced subsetter work.
    let response = t
        .app
        .clone()
        .oneshot(
            Request::get(format!("/work?serviceID={SUBSET_IMAGE}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A duplicate report for the now-terminal item conflicts.
    let response = t
        .app
        .clone()
        .oneshot(json_request("PUT", &format!("/work/{item_id}"), report))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Unknown items are 404.
    let response = t
        .app
        .oneshot(json_request(
            "PUT",
            "/work/999999",
            json!({"status": "successful"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pause_resume_and_cancel_flow() {
    let t = test_app();
    let job = plan_test_job(&t.planner).await;
    let ids = json!({"jobIDs": [job.job_id]});

    let response = t
        .app
        .clone()
        .oneshot(json_request("POST", "/jobs/pause", ids.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body[0]["status"], "paused");

    // Paused jobs yield no work.
    let response = t
        .app
        .clone()
        .oneshot(
            Request::get(format!("/work?serviceID={QUERY_CMR_IMAGE}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = t
        .app
        .clone()
        .oneshot(json_request("POST", "/jobs/resume", ids.clone()))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body[0]["status"], "running");

    let response = t
        .app
        .clone()
        .oneshot(json_request("POST", "/jobs/cancel", ids.clone()))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body[0]["status"], "canceled");

    // Pausing a canceled job is a conflict.
    let response = t
        .app
        .oneshot(json_request("POST", "/jobs/pause", ids))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn labels_are_normalized_on_write() {
    let t = test_app();
    let job = plan_test_job(&t.planner).await;

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/labels",
            json!({"jobID": [job.job_id], "label": ["  Urgent ", "prod", "URGENT"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["labels"], json!(["prod", "urgent"]));

    let response = t
        .app
        .oneshot(json_request(
            "DELETE",
            "/labels",
            json!({"jobID": [job.job_id], "label": ["prod"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn label_edits_for_unknown_jobs_are_404() {
    let t = test_app();
    let job = plan_test_job(&t.planner).await;
    let body = json!({
        "jobID": [job.job_id, uuid::Uuid::now_v7()],
        "label": ["prod"]
    });

    let response = t
        .app
        .clone()
        .oneshot(json_request("DELETE", "/labels", body.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = t
        .app
        .oneshot(json_request("PUT", "/labels", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn skip_preview_requires_previewing() {
    let t = test_app();
    let job = plan_test_job(&t.planner).await;

    // Job planned small enough to start running, so skipping is a conflict.
    let response = t
        .app
        .oneshot(json_request(
            "POST",
            "/jobs/skip-preview",
            json!({"jobIDs": [job.job_id]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
