//! Latency measurement sidecar
//!
//! Runs next to each application pod. Every request passing through is
//! timed against the client-supplied `X-Timestamp` header and attributed to
//! the `?id=<userID>` query parameter, then transparently proxied to the
//! application. `GET /measurements` hands the collected samples to the
//! descheduler and resets the map, so each sample reaches at most one
//! poller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderName, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::error::Result;
use crate::proxy;
use crate::store::LatencySample;

pub const TIMESTAMP_HEADER: &str = "x-timestamp";

/// Shared sidecar state
#[derive(Clone)]
pub struct SidecarState {
    pod_namespace: String,
    pod_name: String,
    app_address: String,
    samples: Arc<RwLock<HashMap<String, LatencySample>>>,
    http: reqwest::Client,
}

impl SidecarState {
    pub fn new(
        pod_namespace: String,
        pod_name: String,
        app_address: String,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            pod_namespace,
            pod_name,
            app_address,
            samples: Arc::new(RwLock::new(HashMap::new())),
            http,
        })
    }
}

/// Create the sidecar router with the given state
pub fn create_router(state: SidecarState) -> Router {
    Router::new()
        .route("/measurements", get(drain_measurements))
        .fallback(measure_and_proxy)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-requested-with"),
            HeaderName::from_static(TIMESTAMP_HEADER),
        ])
}

/// Hand the collected samples to the poller and reset the map.
async fn drain_measurements(
    State(state): State<SidecarState>,
) -> Json<HashMap<String, LatencySample>> {
    let mut samples = state.samples.write().await;
    debug!(count = samples.len(), "Measurements collected");
    Json(std::mem::take(&mut *samples))
}

/// Record a latency sample when the request carries timing information,
/// then proxy it to the application.
async fn measure_and_proxy(
    State(state): State<SidecarState>,
    Query(params): Query<HashMap<String, String>>,
    req: Request<Body>,
) -> Response {
    record_sample(&state, &params, req.headers()).await;

    match proxy::forward(&state.http, &state.app_address, req).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Failed to proxy request to the application");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

async fn record_sample(
    state: &SidecarState,
    params: &HashMap<String, String>,
    headers: &header::HeaderMap,
) {
    let user_id = params.get("id");
    let client_timestamp = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok());

    match (user_id, client_timestamp) {
        (Some(user_id), Some(client_ms)) => {
            let now = Utc::now();
            let latency = now.timestamp_millis() - client_ms;
            debug!(user = %user_id, latency, "Latency calculated");
            state.samples.write().await.insert(
                user_id.clone(),
                LatencySample {
                    pod_namespace: state.pod_namespace.clone(),
                    pod_name: state.pod_name.clone(),
                    measurement: latency,
                    timestamp: now,
                },
            );
        }
        _ => debug!("Request carried no usable timing information"),
    }
}
