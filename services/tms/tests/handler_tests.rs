#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for TMS handlers
//!
//! Runs the router against the in-memory token and collaborator stores.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tms::{
    Hsm, KeyManager, MemoryDocumentStore, MemoryKeyRegistry, MemoryLedger, MemoryToken,
    SignatureIssuer, SignatureResult,
};
use tms_service::{AppState, server::create_router};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    token: MemoryToken,
    documents: Arc<MemoryDocumentStore>,
    registry: Arc<MemoryKeyRegistry>,
    ledger: Arc<MemoryLedger>,
}

fn test_app() -> TestApp {
    let token = MemoryToken::new("tms", "1234");
    let hsm = Hsm::new(
        Arc::new(token.session_manager("tms", "1234")),
        Duration::from_secs(5),
    );
    let documents = Arc::new(MemoryDocumentStore::new());
    let registry = Arc::new(MemoryKeyRegistry::new());
    let ledger = Arc::new(MemoryLedger::new());
    documents.insert_content("doc-1", "user-1", "hello");

    let state = Arc::new(AppState {
        keys: KeyManager::new(hsm.clone(), registry.clone(), Duration::from_secs(5)),
        issuer: SignatureIssuer::new(
            hsm,
            documents.clone(),
            ledger.clone(),
            Duration::from_secs(5),
        ),
    });

    TestApp {
        router: create_router(state),
        token,
        documents,
        registry,
        ledger,
    }
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn generate(app: &TestApp, owner_id: &str, label: &str) -> StatusCode {
    let (status, _) = send(
        &app.router,
        "POST",
        "/api/keys",
        Some(serde_json::json!({"ownerId": owner_id, "label": label})),
    )
    .await;
    status
}

async fn sign(app: &TestApp, label: &str) -> (StatusCode, serde_json::Value) {
    send(
        &app.router,
        "POST",
        "/api/signatures",
        Some(serde_json::json!({
            "keyLabel": label,
            "ownerId": "user-1",
            "documentId": "doc-1",
        })),
    )
    .await
}

async fn verify(app: &TestApp, label: &str, signature: &str) -> (StatusCode, serde_json::Value) {
    send(
        &app.router,
        "POST",
        "/api/signatures/verify",
        Some(serde_json::json!({
            "signature": signature,
            "documentId": "doc-1",
            "keyLabel": label,
            "ownerId": "user-1",
        })),
    )
    .await
}

#[tokio::test]
async fn test_health() {
    let app = test_app();
    let (status, _) = send(&app.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_generate_list_and_delete_keys() {
    let app = test_app();

    assert_eq!(generate(&app, "user-1", "label-A").await, StatusCode::CREATED);
    assert_eq!(generate(&app, "user-1", "label-A").await, StatusCode::CONFLICT);
    assert_eq!(app.registry.owner_of("label-A").as_deref(), Some("user-1"));

    let (status, body) = send(&app.router, "GET", "/api/keys", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"keys": ["label-A"]}));

    let (status, _) = send(&app.router, "DELETE", "/api/keys/user-1/label-A", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(app.registry.is_empty());
    assert_eq!(app.token.object_count(), 0);

    let (status, body) = send(&app.router, "DELETE", "/api/keys/user-1/label-A", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("label-A"));
}

#[tokio::test]
async fn test_generate_rejects_empty_label() {
    let app = test_app();
    assert_eq!(generate(&app, "user-1", "").await, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sign_and_verify() {
    let app = test_app();
    generate(&app, "user-1", "label-A").await;

    let (status, body) = sign(&app, "label-A").await;
    assert_eq!(status, StatusCode::OK);
    let signed: SignatureResult = serde_json::from_value(body).unwrap();
    assert!(signed.valid);
    assert_eq!(app.ledger.len(), 1);

    let (status, body) = verify(&app, "label-A", &signed.signature).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["signature"], signed.signature.as_str());

    app.documents.update_content("doc-1", "tampered");
    let (status, body) = verify(&app, "label-A", &signed.signature).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);
}

#[tokio::test]
async fn test_verify_mismatched_signature_is_invalid_not_error() {
    let app = test_app();
    generate(&app, "user-1", "label-A").await;
    sign(&app, "label-A").await;

    let (status, body) = verify(&app, "label-A", "AAAA").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"signature": "AAAA", "valid": false}));
}

#[tokio::test]
async fn test_error_statuses() {
    let app = test_app();
    generate(&app, "user-1", "label-A").await;

    let (status, _) = sign(&app, "label-Z").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = verify(&app, "label-A", "AAAA").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    sign(&app, "label-A").await;
    let (status, _) = verify(&app, "label-A", "***").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    app.ledger.set_reject_appends(true);
    let (status, body) = sign(&app, "label-A").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("Ledger"));

    app.token.set_fail_open(true);
    let (status, _) = send(&app.router, "GET", "/api/keys", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_registry_failure_is_bad_gateway_and_leaves_no_keys() {
    let app = test_app();
    app.registry.set_fail_writes(true);

    assert_eq!(generate(&app, "user-1", "label-A").await, StatusCode::BAD_GATEWAY);
    assert_eq!(app.token.object_count(), 0);
}
