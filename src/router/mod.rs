//! Routing manager
//!
//! Steers each user's requests to the pod the descheduler found best for
//! them. The association view is replaced wholesale by
//! `POST /update-associations`; all other requests are proxied to the
//! associated pod, or to a random pod of the app when no association
//! resolves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::k8s::K8sClient;
use crate::proxy;
use crate::store::{AssociationMap, ClusterInfo};

/// Shared routing manager state
#[derive(Clone)]
pub struct RouterState {
    app_name: String,
    sidecar_port: u16,
    associations: Arc<RwLock<AssociationMap>>,
    k8s: K8sClient,
    http: reqwest::Client,
}

impl RouterState {
    pub fn new(
        app_name: String,
        sidecar_port: u16,
        k8s: K8sClient,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            app_name,
            sidecar_port,
            associations: Arc::new(RwLock::new(AssociationMap::new())),
            k8s,
            http,
        })
    }

    /// The association currently held for this user and the router's app.
    pub async fn association_for(&self, user_id: &str) -> Option<ClusterInfo> {
        let associations = self.associations.read().await;
        associations.get(user_id)?.get(&self.app_name).cloned()
    }
}

/// Create the routing manager router with the given state
pub fn create_router(state: RouterState) -> Router {
    Router::new()
        .route("/update-associations", post(update_associations))
        .fallback(route_user_request)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Replace the association view with the descheduler's snapshot.
async fn update_associations(
    State(state): State<RouterState>,
    Json(associations): Json<AssociationMap>,
) -> StatusCode {
    info!(users = associations.len(), "Updating associations");
    *state.associations.write().await = associations;
    StatusCode::OK
}

/// Proxy a user request to its associated pod, or to a random pod of the
/// app when no association resolves.
async fn route_user_request(
    State(state): State<RouterState>,
    Query(params): Query<HashMap<String, String>>,
    req: Request<Body>,
) -> Response {
    let Some(user_id) = params.get("id") else {
        warn!("User ID not provided in the request");
        return (StatusCode::BAD_REQUEST, "User ID not provided").into_response();
    };

    let ip = match resolve_target_ip(&state, user_id).await {
        Ok(ip) => ip,
        Err(e) => {
            error!(user = %user_id, error = %e, "No pod available for request");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let target = format!("http://{ip}:{}", state.sidecar_port);
    match proxy::forward(&state.http, &target, req).await {
        Ok(response) => response,
        Err(e) => {
            error!(target = %target, error = %e, "Failed to proxy request");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Resolve the pod IP serving this user: the associated pod when it still
/// exists, otherwise a random pod of the app.
async fn resolve_target_ip(state: &RouterState, user_id: &str) -> Result<String> {
    if let Some(info) = state.association_for(user_id).await {
        match state.k8s.pod_ip(&info.pod_name).await {
            Ok(ip) => return Ok(ip),
            Err(e) => {
                warn!(pod = %info.pod_name, error = %e, "Associated pod not resolvable, falling back");
            }
        }
    }
    state.k8s.random_pod_ip(&state.app_name).await
}
