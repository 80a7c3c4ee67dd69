//! HTTP API 集成测试

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use iam_core::{
    authz::VersionNotifier,
    context::OpContext,
    models::assignment::{GrantRequest, SubjectType},
};
use serde_json::{json, Value};
use tower::ServiceExt;

mod common;
use common::TestStack;

const FORM: &str = "scale:form:*";

fn router(stack: &TestStack) -> Router {
    iam_core::routes::create_router(stack.app_state())
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn with_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

// ==================== Health ====================

#[tokio::test]
async fn test_health_endpoint() {
    let stack = TestStack::new().await;
    let app = router(&stack);

    let (status, json) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert!(json["uptime_secs"].is_number());
}

#[tokio::test]
async fn test_readiness_tracks_notifier() {
    let stack = TestStack::new().await;
    let app = router(&stack);

    let (status, json) = send(&app, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ready"], true);
    assert_eq!(json["checks"][0]["name"], "notifier");

    stack.notifier.close().await.unwrap();
    let (status, json) = send(&app, get("/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["ready"], false);
}

#[tokio::test]
async fn test_trace_id_is_echoed() {
    let stack = TestStack::new().await;
    let app = router(&stack);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-trace-id", "trace-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-trace-id"], "trace-123");
    assert!(response.headers().contains_key("x-request-id"));
}

// ==================== JWKS ====================

#[tokio::test]
async fn test_jwks_conditional_get() {
    let stack = TestStack::new().await;
    stack.key_manager.ensure_active_key().await.unwrap();
    let app = router(&stack);

    let response = app
        .clone()
        .oneshot(get("/.well-known/jwks.json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    assert!(headers.contains_key(header::LAST_MODIFIED));
    assert!(headers[header::CACHE_CONTROL]
        .to_str()
        .unwrap()
        .contains("max-age"));
    let etag = headers[header::ETAG].to_str().unwrap().to_string();

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let jwks: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(jwks["keys"].as_array().unwrap().len(), 1);
    assert_eq!(jwks["keys"][0]["kty"], "RSA");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/.well-known/jwks.json")
                .header(header::IF_NONE_MATCH, &etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers()[header::ETAG], etag.as_str());

    // 轮换后旧 ETag 失效
    let (status, outcome) = send(&app, with_json("POST", "/api/v1/keys/rotate", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(outcome["new_kid"].is_string());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/.well-known/jwks.json")
                .header(header::IF_NONE_MATCH, &etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_ne!(response.headers()[header::ETAG], etag.as_str());
}

#[tokio::test]
async fn test_key_stats_endpoint() {
    let stack = TestStack::new().await;
    stack.key_manager.ensure_active_key().await.unwrap();
    let app = router(&stack);

    let (status, json) = send(&app, get("/api/v1/keys/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 1);
    assert_eq!(json["active"], 1);

    let (status, _) = send(&app, get("/api/v1/keys/status")).await;
    assert_eq!(status, StatusCode::OK);
}

// ==================== Authorization ====================

#[tokio::test]
async fn test_role_create_and_duplicate() {
    let stack = TestStack::new().await;
    let app = router(&stack);
    let body = json!({ "name": "admin", "display_name": "Admin", "tenant_id": "t1" });

    let (status, role) = send(&app, with_json("POST", "/api/v1/roles", body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(role["name"], "admin");

    let (status, _) = send(&app, with_json("POST", "/api/v1/roles", body)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, page) = send(&app, get("/api/v1/roles?tenant_id=t1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
}

#[tokio::test]
async fn test_role_validation_rejected() {
    let stack = TestStack::new().await;
    let app = router(&stack);

    let (status, _) = send(
        &app,
        with_json(
            "POST",
            "/api/v1/roles",
            json!({ "name": "", "display_name": "Admin", "tenant_id": "t1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_grant_check_revoke_flow() {
    let stack = TestStack::new().await;
    stack.create_resource(FORM, &["read"]).await;
    let app = router(&stack);

    let (_, role) = send(
        &app,
        with_json(
            "POST",
            "/api/v1/roles",
            json!({ "name": "viewer", "display_name": "Viewer", "tenant_id": "t1" }),
        ),
    )
    .await;
    let role_id = role["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        with_json(
            "POST",
            "/api/v1/policies",
            json!({
                "role_id": role_id,
                "resource_key": FORM,
                "action": "read",
                "tenant_id": "t1",
                "changed_by": "tester"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, assignment) = send(
        &app,
        with_json(
            "POST",
            "/api/v1/assignments",
            json!({
                "subject_type": "user",
                "subject_id": "u1",
                "role_id": role_id,
                "tenant_id": "t1",
                "granted_by": "tester"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let assignment_id = assignment["id"].as_str().unwrap().to_string();

    let check = json!({
        "subject": "user:u1",
        "action": "read",
        "resource": FORM,
        "tenant_id": "t1"
    });
    let (status, decision) = send(&app, with_json("POST", "/api/v1/authz/check", check.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decision["allowed"], true);

    let (status, version) = send(&app, get("/api/v1/authz/version/t1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(version["tenant_id"], "t1");
    assert_eq!(version["version"], 2);

    let (status, _) = send(
        &app,
        delete(&format!(
            "/api/v1/assignments/{}?tenant_id=t1&revoked_by=tester",
            assignment_id
        )),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, decision) = send(&app, with_json("POST", "/api/v1/authz/check", check)).await;
    assert_eq!(decision["allowed"], false);

    let (_, version) = send(&app, get("/api/v1/authz/version/t1")).await;
    assert_eq!(version["version"], 3);
}

#[tokio::test]
async fn test_delete_role_requires_cascade() {
    let stack = TestStack::new().await;
    stack.create_resource(FORM, &["read"]).await;
    let role = stack.create_role("editor", "t1").await;
    let ctx = OpContext::background();
    stack
        .policies
        .add_policy_rule(&ctx, common::policy_request(role.id, FORM, "read", "t1"))
        .await
        .unwrap();
    stack
        .assignments
        .grant(
            &ctx,
            GrantRequest {
                subject_type: SubjectType::User,
                subject_id: "u1".to_string(),
                role_id: role.id,
                tenant_id: "t1".to_string(),
                granted_by: "tester".to_string(),
            },
        )
        .await
        .unwrap();
    let app = router(&stack);

    let (status, _) = send(&app, delete(&format!("/api/v1/roles/{}?tenant_id=t1", role.id))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        delete(&format!("/api/v1/roles/{}?tenant_id=t1&cascade=true", role.id)),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, page) = send(&app, get("/api/v1/roles?tenant_id=t1")).await;
    assert_eq!(page["total"], 0);
}

#[tokio::test]
async fn test_check_malformed_subject_is_bad_request() {
    let stack = TestStack::new().await;
    let app = router(&stack);

    let (status, _) = send(
        &app,
        with_json(
            "POST",
            "/api/v1/authz/check",
            json!({ "subject": "u1", "action": "read", "resource": FORM, "tenant_id": "t1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let stack = TestStack::new().await;
    let app = router(&stack);

    let description = "x".repeat(128 * 1024);
    let (status, _) = send(
        &app,
        with_json(
            "POST",
            "/api/v1/roles",
            json!({ "name": "big", "display_name": "Big", "tenant_id": "t1", "description": description }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}
