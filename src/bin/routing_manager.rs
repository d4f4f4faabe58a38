use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use latency_scheduler::config::Config;
use latency_scheduler::k8s::K8sClient;
use latency_scheduler::router::{self, RouterState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "latency_scheduler=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting routing manager");

    let config = Config::load()?;
    let app_name = config
        .app_name
        .clone()
        .context("APP_NAME environment variable is not set")?;

    let k8s = K8sClient::new(None).await?.with_namespace(&config.app_namespace);

    let state = RouterState::new(
        app_name,
        config.sidecar_port,
        k8s,
        Duration::from_secs(config.http_timeout_secs),
    )?;
    let app = router::create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.router_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
