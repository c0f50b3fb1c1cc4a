//! HTTP surface integration tests.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use serde_json::Value;
use tower::ServiceExt;

mod common;
use common::TestHarness;

/// The health endpoint answers without any session state.
#[tokio::test]
async fn health_endpoint() {
    let harness = TestHarness::new().await;
    let app = bosun::api::router(harness.state.clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

/// The WebSocket route rejects plain GET requests without an upgrade.
#[tokio::test]
async fn ws_route_requires_upgrade() {
    let harness = TestHarness::new().await;
    let app = bosun::api::router(harness.state.clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/ws")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_ne!(response.status(), StatusCode::OK);
}
