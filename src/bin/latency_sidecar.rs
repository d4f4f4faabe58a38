use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use latency_scheduler::config::Config;
use latency_scheduler::k8s::K8sClient;
use latency_scheduler::sidecar::{self, SidecarState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "latency_scheduler=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting latency sidecar");

    let config = Config::load()?;
    let pod_name = config
        .pod_name
        .clone()
        .context("POD_NAME environment variable is not set")?;

    // Resolve our own pod object so samples carry the right identity.
    let k8s = K8sClient::new(None).await?.with_namespace(&config.app_namespace);
    let pod = k8s.get_pod(&pod_name).await?;
    let pod_namespace = pod
        .metadata
        .namespace
        .unwrap_or_else(|| config.app_namespace.clone());

    tracing::info!(pod = %pod_name, namespace = %pod_namespace, app = %config.app_address, "Sidecar identity resolved");

    let state = SidecarState::new(
        pod_namespace,
        pod_name,
        config.app_address.clone(),
        Duration::from_secs(config.http_timeout_secs),
    )?;
    let app = sidecar::create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.sidecar_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
