//! Integration tests for the latency sidecar
//!
//! Drive the sidecar router against a local stand-in application and check
//! the measurement and drain semantics.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::get,
    Router,
};
use chrono::Utc;
use serde_json::Value;
use tower::ServiceExt;

use latency_scheduler::sidecar::{self, SidecarState};
use latency_scheduler::store::LatencySample;

/// Spawn a throwaway application server and return its base URL.
async fn spawn_app() -> String {
    let app = Router::new()
        .route("/", get(|| async { "hello from app" }))
        .fallback(|| async { "fallback from app" });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn setup_sidecar() -> Router {
    let app_address = spawn_app().await;
    let state = SidecarState::new(
        "default".to_string(),
        "shop-abc".to_string(),
        app_address,
        Duration::from_secs(2),
    )
    .unwrap();
    sidecar::create_router(state)
}

fn timed_request(path: &str, offset_ms: i64) -> Request<Body> {
    let client_ts = Utc::now().timestamp_millis() - offset_ms;
    Request::builder()
        .uri(path)
        .header("X-Timestamp", client_ts.to_string())
        .body(Body::empty())
        .unwrap()
}

async fn drain(app: &Router) -> HashMap<String, LatencySample> {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/measurements")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_request_is_measured_and_proxied() {
    let app = setup_sidecar().await;

    let response = app
        .clone()
        .oneshot(timed_request("/?id=alice", 25))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"hello from app");

    let samples = drain(&app).await;
    let sample = &samples["alice"];
    assert_eq!(sample.pod_name, "shop-abc");
    assert_eq!(sample.pod_namespace, "default");
    assert!(sample.measurement >= 25);
}

#[tokio::test]
async fn test_drain_resets_the_map() {
    let app = setup_sidecar().await;

    app.clone()
        .oneshot(timed_request("/?id=x", 10))
        .await
        .unwrap();
    app.clone()
        .oneshot(timed_request("/page?id=y", 20))
        .await
        .unwrap();

    let first = drain(&app).await;
    assert_eq!(first.len(), 2);
    assert!(first.contains_key("x"));
    assert!(first.contains_key("y"));

    let second = drain(&app).await;
    assert!(second.is_empty());
}

#[tokio::test]
async fn test_bad_timestamp_skips_sample_but_still_proxies() {
    let app = setup_sidecar().await;

    let request = Request::builder()
        .uri("/?id=alice")
        .header("X-Timestamp", "not-a-number")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert!(drain(&app).await.is_empty());
}

#[tokio::test]
async fn test_request_without_user_id_is_not_measured() {
    let app = setup_sidecar().await;

    let response = app.clone().oneshot(timed_request("/", 10)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert!(drain(&app).await.is_empty());
}

#[tokio::test]
async fn test_measurements_wire_format() {
    let app = setup_sidecar().await;
    app.clone()
        .oneshot(timed_request("/?id=alice", 30))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/measurements")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();

    let sample = &json["alice"];
    assert_eq!(sample["PodName"], "shop-abc");
    assert_eq!(sample["PodNamespace"], "default");
    assert!(sample["Measurement"].is_i64());
    assert!(sample["Timestamp"].is_string());
}
