//! Pending-pod watcher
//!
//! Watches pods that requested this scheduler and are not yet bound, and
//! feeds their keys into the scheduler's work queue.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::watcher::{self, Event as WatchEvent},
    Client,
};
use tracing::{error, info, warn};

use crate::scheduler::queue::WorkQueue;

/// Start watching unbound pods addressed to `scheduler_name`.
///
/// Runs until the watch stream ends; stream errors are logged and the watch
/// continues.
pub async fn watch_pending_pods(client: Client, scheduler_name: &str, queue: Arc<WorkQueue>) {
    info!(scheduler = scheduler_name, "Starting pending-pod watcher");

    let pods: Api<Pod> = Api::all(client);
    let watcher_config = watcher::Config::default()
        .fields(&format!("spec.schedulerName={scheduler_name},spec.nodeName="));

    let mut pod_stream = watcher::watcher(pods, watcher_config).boxed();

    while let Some(event) = pod_stream.next().await {
        match event {
            Ok(WatchEvent::Applied(pod)) => {
                enqueue(&queue, &pod).await;
            }
            Ok(WatchEvent::Deleted(_)) => {}
            Ok(WatchEvent::Restarted(pods)) => {
                info!("Pod watcher restarted, {} pending pods found", pods.len());
                for pod in pods {
                    enqueue(&queue, &pod).await;
                }
            }
            Err(e) => {
                error!("Pod watcher error: {}", e);
                // Don't break, try to continue watching
            }
        }
    }

    warn!("Pod watcher stream ended");
}

async fn enqueue(queue: &WorkQueue, pod: &Pod) {
    if let Some(key) = pod_key(pod) {
        queue.add(key).await;
    }
}

/// `namespace/name` key for a pod, mirroring the orchestrator's object keys.
pub fn pod_key(pod: &Pod) -> Option<String> {
    let namespace = pod.metadata.namespace.as_deref()?;
    let name = pod.metadata.name.as_deref()?;
    Some(format!("{namespace}/{name}"))
}
