use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use latency_scheduler::config::Config;
use latency_scheduler::descheduler::Descheduler;
use latency_scheduler::k8s::K8sClient;
use latency_scheduler::scheduler::Scheduler;
use latency_scheduler::store::{AssociationStore, MeasurementStore, ThresholdStore};

/// Latency-aware scheduler and descheduler
#[derive(Debug, Parser)]
#[command(name = "controller")]
struct Args {
    /// Path to the kubeconfig file; falls back to in-cluster configuration
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "latency_scheduler=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting latency-aware placement controller");

    let args = Args::parse();
    let config = Config::load()?;
    let k8s = K8sClient::new(args.kubeconfig.as_deref())
        .await?
        .with_namespace(&config.app_namespace);

    // Process-wide stores, shared between the two loops by handle.
    let hard_thresholds = Arc::new(ThresholdStore::new());
    let soft_thresholds = Arc::new(ThresholdStore::new());
    let measurements = Arc::new(MeasurementStore::new());
    let associations = Arc::new(AssociationStore::new());
    let sched_lock = Arc::new(Mutex::new(()));

    let scheduler = Scheduler::new(
        k8s.clone(),
        config.clone(),
        Arc::clone(&sched_lock),
        Arc::clone(&hard_thresholds),
        Arc::clone(&soft_thresholds),
    );
    let descheduler = Descheduler::new(
        k8s,
        config,
        sched_lock,
        measurements,
        associations,
        hard_thresholds,
        soft_thresholds,
    )?;

    let scheduler_task = tokio::spawn(async move { scheduler.run().await });
    let descheduler_task = tokio::spawn(async move { descheduler.run().await });

    let (scheduler_result, descheduler_result) = tokio::join!(scheduler_task, descheduler_task);
    scheduler_result?;
    descheduler_result?;

    Ok(())
}
