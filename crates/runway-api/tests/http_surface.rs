//! HTTP surface tests against the in-process router

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use runway_api::build_router;
use runway_engine::testing::test_settings;
use runway_engine::{Collaborators, Runtime};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn build_app(dir: &tempfile::TempDir) -> (Arc<Runtime>, Router) {
    let settings = test_settings(dir.path().join("data"));
    let runtime = Arc::new(
        Runtime::build(settings, Collaborators::default())
            .await
            .expect("runtime builds"),
    );
    if let Some(store) = &runtime.retrieval_store {
        store.add_document(
            "strategy-notes",
            "Strategy is a plan of action designed to achieve a long-term goal.",
        );
    }
    runtime.start();
    let router = build_router(runtime.clone());
    (runtime, router)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body readable")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn test_health() {
    let dir = tempfile::tempdir().unwrap();
    let (_runtime, router) = build_app(&dir).await;

    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_run_and_read_state() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, router) = build_app(&dir).await;

    let response = router
        .clone()
        .oneshot(post_json(
            "/runs",
            json!({
                "message": "What is strategy?",
                "mode": "answer",
                "identity": {"tenant_id": "acme", "user_id": "u-1"}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let run_id = body["run_id"].as_str().expect("run id").to_string();

    // Wait for the run to finish, then read both snapshots over HTTP.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let state = runtime
            .projector
            .load(&run_id)
            .await
            .expect("snapshot readable");
        if state.map(|s| s.is_terminal()).unwrap_or(false) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "run did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let response = router
        .clone()
        .oneshot(
            Request::get(format!("/runs/{run_id}/state"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let state = body_json(response).await;
    assert_eq!(state["outcome"], "success");
    assert_eq!(state["identity"]["tenant_id"], "acme");

    let response = router
        .oneshot(
            Request::get(format!("/runs/{run_id}/workflow"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let workflow = body_json(response).await;
    assert_eq!(workflow["status"], "completed");

    runtime.shutdown();
}

#[tokio::test]
async fn test_custom_run_id_header() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, router) = build_app(&dir).await;

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/runs")
                .header("content-type", "application/json")
                .header("X-Run-Id", "my-run-1")
                .body(Body::from(
                    json!({
                        "message": "What is strategy?",
                        "mode": "answer",
                        "identity": {"tenant_id": "acme", "user_id": "u-1"}
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["run_id"], "my-run-1");

    runtime.shutdown();
}

#[tokio::test]
async fn test_empty_message_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, router) = build_app(&dir).await;

    let response = router
        .oneshot(post_json(
            "/runs",
            json!({
                "message": "   ",
                "mode": "answer",
                "identity": {"tenant_id": "acme", "user_id": "u-1"}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    runtime.shutdown();
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, router) = build_app(&dir).await;

    for uri in [
        "/runs/ghost/state",
        "/runs/ghost/workflow",
        "/runs/ghost/events",
    ] {
        let response = router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }

    let response = router
        .oneshot(post_json("/runs/ghost/approval", json!({"decision": "approved"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    runtime.shutdown();
}

#[tokio::test]
async fn test_approval_on_finished_run_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, router) = build_app(&dir).await;

    let response = router
        .clone()
        .oneshot(post_json(
            "/runs",
            json!({
                "message": "What is strategy?",
                "mode": "answer",
                "identity": {"tenant_id": "acme", "user_id": "u-1"}
            }),
        ))
        .await
        .unwrap();
    let run_id = body_json(response).await["run_id"]
        .as_str()
        .expect("run id")
        .to_string();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let state = runtime
            .projector
            .load(&run_id)
            .await
            .expect("snapshot readable");
        if state.map(|s| s.is_terminal()).unwrap_or(false) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "run did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let response = router
        .oneshot(post_json(
            &format!("/runs/{run_id}/approval"),
            json!({"decision": "approved"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    runtime.shutdown();
}
