//! HTTP adapter driven in-process with `oneshot`.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use devpilot::ai::Purpose;
use devpilot::core::TaskStatus;
use devpilot::http::{self, USER_HEADER};

use crate::fixtures::*;

async fn send(app: &Router, method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(USER_HEADER, user);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn harness(repo: &TestRepo) -> Harness {
    Harness::new(
        repo,
        ScriptedAi::new()
            .reply(Purpose::Decompose, plan_for("server/health.ts"))
            .reply(Purpose::Generate, file_reply("server/health.ts", HEALTH_TS)),
    )
}

#[tokio::test]
async fn test_submit_approve_rollback_over_http() {
    let repo = TestRepo::new();
    let harness = harness(&repo);
    let app = http::app(harness.orchestrator.clone());

    let (status, body) = send(
        &app,
        "POST",
        "/tasks",
        Some("alice"),
        Some(json!({ "prompt": "Add a health check endpoint" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    let id = body["taskId"].as_str().unwrap().to_string();

    let task = harness
        .orchestrator
        .wait_until_settled(id.parse().unwrap(), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::AwaitingApproval);

    let (status, body) = send(&app, "GET", &format!("/tasks/{}", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "awaiting_approval");
    assert_eq!(body["validationReport"]["safe"], true);
    assert_eq!(body["validationReport"]["tests"]["skipped"], true);
    assert_eq!(body["validationReport"]["warnings"][0], "no test command configured, tests were skipped");

    let (status, body) = send(&app, "POST", &format!("/tasks/{}/approve", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert!(repo.read("server/health.ts").is_some());

    let (status, body) = send(&app, "POST", &format!("/tasks/{}/approve", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "approval_state_error");

    let (status, _) = send(&app, "POST", &format!("/tasks/{}/rollback", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(repo.read("server/health.ts").is_none());

    let (status, body) = send(&app, "POST", &format!("/tasks/{}/rollback", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "rollback_unavailable");
}

#[tokio::test]
async fn test_identity_and_ownership() {
    let repo = TestRepo::new();
    let harness = harness(&repo);
    let app = http::app(harness.orchestrator.clone());

    let (status, body) = send(&app, "POST", "/tasks", None, Some(json!({ "prompt": "x" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");

    let (_, body) = send(&app, "POST", "/tasks", Some("alice"), Some(json!({ "prompt": "Add a health check" }))).await;
    let id = body["taskId"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "GET", &format!("/tasks/{}", id), Some("mallory"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let unknown = uuid::Uuid::new_v4();
    let (status, _) = send(&app, "GET", &format!("/tasks/{}", unknown), Some("alice"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "GET", "/tasks/not-a-uuid", Some("alice"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_bodies_are_bad_requests() {
    let repo = TestRepo::new();
    let harness = harness(&repo);
    let app = http::app(harness.orchestrator.clone());

    let (status, _) = send(&app, "POST", "/tasks", Some("alice"), Some(json!({ "prompt": "   " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", "/tasks", Some("alice"), Some(json!({ "wrong": 1 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", "/validate", Some("alice"), Some(json!({ "files": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_validate_endpoint() {
    let repo = TestRepo::new();
    let harness = harness(&repo);
    let app = http::app(harness.orchestrator.clone());

    let (status, body) = send(
        &app,
        "POST",
        "/validate",
        Some("alice"),
        Some(json!({ "files": [
            { "path": "server/health.ts", "content": HEALTH_TS },
            { "path": "server/broken.ts", "content": "export function f() {\n" }
        ]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["safe"], false);
    assert!(body["totalErrors"].as_u64().unwrap() >= 1);
    assert!(repo.read("server/health.ts").is_none(), "validation writes nothing");

    let (status, body) = send(
        &app,
        "POST",
        "/validate",
        Some("alice"),
        Some(json!({ "files": [{ "path": "../../etc/passwd", "content": "x" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "path_security_error");
}

#[tokio::test]
async fn test_health() {
    let repo = TestRepo::new();
    let harness = harness(&repo);
    let app = http::app(harness.orchestrator.clone());

    let (status, body) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["toolBudget"], 100);
}
