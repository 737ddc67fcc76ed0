//! HTTP control surface integration tests
//!
//! Requests go straight through the router with `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use runsched::capacity::StoreCapacityOracle;
use runsched::config::{Config, StoreConfig};
use runsched::executor::{ExecutionMode, ExternalExecutor};
use runsched::lifecycle::Controller;
use runsched::scheduler::Scheduler;
use runsched::server::{AppState, build_router};
use runsched::store::Database;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

const TOKEN: &str = "s3cret";

fn app_with(temp: &TempDir, configure: impl FnOnce(&mut Config)) -> Router {
    let mut config = Config::default();
    config.store = StoreConfig {
        path: temp.path().join("runsched.db"),
        ..StoreConfig::default()
    };
    config.executor.mode = ExecutionMode::External;
    config.server.auth_token = Some(TOKEN.to_string());
    configure(&mut config);

    let db = Database::open(&config.store).unwrap();
    let scheduler = Scheduler::new(
        db,
        Arc::new(config),
        Arc::new(ExternalExecutor::new(None)),
        Arc::new(StoreCapacityOracle),
    );
    build_router(Arc::new(AppState::new(Controller::new(scheduler))))
}

fn app(temp: &TempDir) -> Router {
    app_with(temp, |_| {})
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn create_source(app: &Router, url: &str) -> i64 {
    let (status, body) = send(app, request("POST", "/api/sources", Some(json!({ "url": url })))).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body["source"]["id"].as_i64().unwrap()
}

#[tokio::test]
async fn test_health_needs_no_token() {
    let temp = TempDir::new().unwrap();
    let app = app(&temp);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_or_wrong_token_is_unauthorized() {
    let temp = TempDir::new().unwrap();
    let app = app(&temp);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/sources").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/api/sources")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn test_source_crud() {
    let temp = TempDir::new().unwrap();
    let app = app(&temp);

    let id = create_source(&app, "https://savee.it/pop").await;

    let (status, body) = send(&app, request("POST", "/api/sources", Some(json!({ "url": "https://savee.it/pop" })))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], json!(false));
    assert_eq!(body["source"]["id"].as_i64(), Some(id));

    let (status, body) = send(&app, request("GET", "/api/sources", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sources"].as_array().unwrap().len(), 1);
    assert_eq!(body["sources"][0]["category"], json!("pop"));

    let (status, body) = send(
        &app,
        request("PATCH", &format!("/api/sources/{}", id), Some(json!({ "interval_seconds": 120 }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"]["interval_seconds"], json!(120));

    let (status, body) = send(&app, request("POST", &format!("/api/sources/{}/pause", id), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"]["status"], json!("paused"));

    let (status, _) = send(&app, request("DELETE", &format!("/api/sources/{}", id), None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, request("GET", &format!("/api/sources/{}", id), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn test_invalid_url_is_bad_request() {
    let temp = TempDir::new().unwrap();
    let app = app(&temp);

    let (status, body) = send(&app, request("POST", "/api/sources", Some(json!({ "url": "ftp://savee.it/pop" })))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));
    assert!(body["error"].as_str().unwrap().contains("Invalid input"));
}

fn raw_post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn assert_invalid_input(status: StatusCode, body: &Value) {
    assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
    assert_eq!(body["success"], json!(false));
    assert!(body["error"].as_str().unwrap().contains("Invalid input"), "{}", body);
}

#[tokio::test]
async fn test_malformed_json_body_is_json_bad_request() {
    let temp = TempDir::new().unwrap();
    let app = app(&temp);

    let (status, body) = send(&app, raw_post("/api/sources", "{not json")).await;
    assert_invalid_input(status, &body);
}

#[tokio::test]
async fn test_wrongly_typed_body_is_bad_request_not_unprocessable() {
    let temp = TempDir::new().unwrap();
    let app = app(&temp);

    let (status, body) = send(&app, raw_post("/api/sources", r#"{"url":5}"#)).await;
    assert_invalid_input(status, &body);

    let id = create_source(&app, "https://savee.it/pop").await;
    let (_, run) = send(&app, request("POST", &format!("/api/sources/{}/run", id), None)).await;
    let run_id = run["run"]["run_id"].as_i64().unwrap();
    let (status, body) = send(&app, raw_post(&format!("/api/runs/{}/exit", run_id), r#"{"code":"zero"}"#)).await;
    assert_invalid_input(status, &body);
}

#[tokio::test]
async fn test_missing_content_type_is_bad_request() {
    let temp = TempDir::new().unwrap();
    let app = app(&temp);

    let request = Request::builder()
        .method("POST")
        .uri("/api/sources")
        .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
        .body(Body::from(r#"{"url":"https://savee.it/pop"}"#))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_invalid_input(status, &body);
}

#[tokio::test]
async fn test_non_numeric_id_and_bad_query_are_bad_request() {
    let temp = TempDir::new().unwrap();
    let app = app(&temp);
    let id = create_source(&app, "https://savee.it/pop").await;

    let (status, body) = send(&app, request("GET", "/api/sources/abc", None)).await;
    assert_invalid_input(status, &body);

    let (status, body) = send(&app, request("POST", "/api/runs/abc/claim", None)).await;
    assert_invalid_input(status, &body);

    let (status, body) = send(&app, request("POST", &format!("/api/sources/{}/run?force=maybe", id), None)).await;
    assert_invalid_input(status, &body);

    let (status, body) = send(&app, request("GET", "/api/engine/pending?limit=-1", None)).await;
    assert_invalid_input(status, &body);
}

#[tokio::test]
async fn test_run_now_then_overlap_is_conflict() {
    let temp = TempDir::new().unwrap();
    let app = app(&temp);
    let id = create_source(&app, "https://savee.it/pop").await;

    let (status, body) = send(&app, request("POST", &format!("/api/sources/{}/run?max_items=25", id), None)).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["run"]["max_items"], json!(25));
    assert_eq!(body["run"]["status"], json!("pending"));
    let run_id = body["run"]["run_id"].as_i64().unwrap();

    let (status, body) = send(&app, request("POST", &format!("/api/sources/{}/run?force=true", id), None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], json!("already_running"));

    let (status, body) = send(&app, request("GET", "/api/engine/pending", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending"][0]["runId"].as_i64(), Some(run_id));
    assert_eq!(body["pending"][0]["maxItems"], json!(25));
}

#[tokio::test]
async fn test_run_now_over_capacity_is_too_many_requests() {
    let temp = TempDir::new().unwrap();
    let app = app_with(&temp, |c| c.capacity.row_soft_limit = 0);
    let id = create_source(&app, "https://savee.it/pop").await;

    let (status, body) = send(&app, request("POST", &format!("/api/sources/{}/run", id), None)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["reason"], json!("over_capacity"));

    let (status, _) = send(&app, request("POST", &format!("/api/sources/{}/run?force=true", id), None)).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_external_worker_lifecycle() {
    let temp = TempDir::new().unwrap();
    let app = app(&temp);
    let id = create_source(&app, "https://savee.it/pop").await;

    let (_, body) = send(&app, request("POST", &format!("/api/sources/{}/run", id), None)).await;
    let run_id = body["run"]["run_id"].as_i64().unwrap();

    let (status, _) = send(&app, request("POST", &format!("/api/runs/{}/claim", run_id), None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, request("POST", &format!("/api/runs/{}/claim", run_id), None)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &app,
        request(
            "POST",
            &format!("/api/runs/{}/progress", run_id),
            Some(json!({ "found": 4, "uploaded": 2, "errors": 0, "skipped": 1 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["counters"]["uploaded"], json!(2));

    let (status, _) = send(
        &app,
        request(
            "POST",
            &format!("/api/runs/{}/logs", run_id),
            Some(json!({ "stage": "UPLOAD", "item_url": "https://savee.it/i/abc", "outcome": "✓" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(
        &app,
        request(
            "POST",
            &format!("/api/runs/{}/outputs", run_id),
            Some(json!({ "external_id": "abc", "bytes": 1024 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, request("GET", &format!("/api/runs/{}/logs?limit=10", run_id), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["logs"].as_array().unwrap().len(), 1);
    assert_eq!(body["logs"][0]["stage"], json!("UPLOAD"));

    let (status, body) = send(
        &app,
        request("POST", &format!("/api/runs/{}/exit", run_id), Some(json!({ "code": 0 }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run"]["status"], json!("completed"));
    assert_eq!(body["run"]["run_status"], json!("completed"));

    let (status, body) = send(&app, request("GET", &format!("/api/sources/{}/runs", id), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runs"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_reconcile_and_stop() {
    let temp = TempDir::new().unwrap();
    let app = app(&temp);
    let id = create_source(&app, "https://savee.it/pop").await;

    let (_, body) = send(&app, request("POST", &format!("/api/sources/{}/run", id), None)).await;
    let run_id = body["run"]["run_id"].as_i64().unwrap();

    // Fresh run needs force
    let (status, _) = send(&app, request("POST", &format!("/api/runs/{}/reconcile", run_id), None)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&app, request("POST", &format!("/api/runs/{}/reconcile?force=true", run_id), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reconcile"]["changed"], json!(true));
    assert_eq!(body["reconcile"]["run"]["status"], json!("completed"));

    let (status, body) = send(&app, request("POST", &format!("/api/sources/{}/stop", id), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stop"]["source"]["status"], json!("stopped"));
    assert!(body["stop"]["stopped_run"].is_null());

    let (status, body) = send(&app, request("POST", &format!("/api/sources/{}/run?force=true", id), None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], json!("source_stopped"));

    let (status, _) = send(&app, request("POST", "/api/runs/999/reconcile", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sweep_endpoint() {
    let temp = TempDir::new().unwrap();
    let app = app(&temp);
    create_source(&app, "https://savee.it/pop").await;
    create_source(&app, "https://savee.it/someone").await;

    let (status, body) = send(&app, request("POST", "/api/engine/sweep", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["report"]["started"].as_array().unwrap().len(), 2);
}
