//! Latency-aware pod scheduler
//!
//! Binds pending pods that requested this scheduler to nodes, following a
//! round-robin exploration of the cluster: per app, every schedulable node
//! gets visited once (best allocatable score first) before the cycle
//! restarts. Latency thresholds found on a pod's annotations are registered
//! on first sight so the descheduler can classify the nodes being explored.

pub mod queue;
pub mod score;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Node, Pod};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::k8s::{watcher, K8sClient};
use crate::store::ThresholdStore;
use queue::WorkQueue;

pub const APP_LABEL: &str = "app";
pub const HARD_LATENCY_ANNOTATION: &str = "hard_max_latency";
pub const SOFT_LATENCY_ANNOTATION: &str = "soft_max_latency";

pub struct Scheduler {
    k8s: K8sClient,
    config: Config,
    queue: Arc<WorkQueue>,
    sched_lock: Arc<Mutex<()>>,
    hard_thresholds: Arc<ThresholdStore>,
    soft_thresholds: Arc<ThresholdStore>,
    visited_nodes_per_app: Mutex<HashMap<String, HashSet<String>>>,
}

impl Scheduler {
    pub fn new(
        k8s: K8sClient,
        config: Config,
        sched_lock: Arc<Mutex<()>>,
        hard_thresholds: Arc<ThresholdStore>,
        soft_thresholds: Arc<ThresholdStore>,
    ) -> Self {
        Self {
            k8s,
            config,
            queue: WorkQueue::new(),
            sched_lock,
            hard_thresholds,
            soft_thresholds,
            visited_nodes_per_app: Mutex::new(HashMap::new()),
        }
    }

    /// Watch for pending pods and schedule them until the process exits.
    pub async fn run(&self) {
        let client = self.k8s.inner().clone();
        let scheduler_name = self.config.scheduler_name.clone();
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            watcher::watch_pending_pods(client, &scheduler_name, queue).await;
        });

        while let Some(key) = self.queue.next().await {
            debug!(pod = %key, "Processing pending pod");
            match self.schedule_pod(&key).await {
                Ok(()) => self.queue.forget(&key).await,
                Err(e) => {
                    warn!(pod = %key, error = %e, "Scheduling failed, requeueing");
                    self.queue.add_rate_limited(key).await;
                }
            }
        }
    }

    /// Schedule one pod by key. Holds the shared scheduler/descheduler lock
    /// for the whole bind so evictions cannot interleave.
    async fn schedule_pod(&self, key: &str) -> Result<()> {
        let _guard = self.sched_lock.lock().await;

        let (namespace, name) = key
            .split_once('/')
            .with_context(|| format!("malformed pod key {key:?}"))?;

        let pod = match self.k8s.pods_in(namespace).get_opt(name).await? {
            Some(pod) => pod,
            // The pod vanished before we got to it; nothing to schedule.
            None => return Ok(()),
        };
        let already_bound = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.as_deref())
            .is_some();
        if already_bound {
            return Ok(());
        }

        let app = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(APP_LABEL))
            .cloned()
            .ok_or_else(|| AppError::MissingAppLabel(key.to_string()))?;

        self.register_thresholds(&app, &pod).await?;

        let nodes = self.k8s.list_nodes().await?;
        let node = self.choose_node(&app, &nodes).await?;
        self.k8s.bind_pod(namespace, name, &node).await?;

        info!(pod = %key, app = %app, node = %node, "Assigned pod to node");
        Ok(())
    }

    /// Register the pod's latency annotations, first write per app wins.
    async fn register_thresholds(&self, app: &str, pod: &Pod) -> Result<()> {
        let annotations = pod.metadata.annotations.as_ref();

        if self.hard_thresholds.get(app).await.is_none() {
            if let Some(raw) = annotations.and_then(|a| a.get(HARD_LATENCY_ANNOTATION)) {
                let latency = raw.parse::<i64>().map_err(|_| AppError::InvalidAnnotation {
                    annotation: HARD_LATENCY_ANNOTATION.to_string(),
                    value: raw.clone(),
                })?;
                info!(app, latency, "Registered hard latency threshold");
                self.hard_thresholds.set(app, latency).await;
            }
        }

        if self.soft_thresholds.get(app).await.is_none() {
            if let Some(raw) = annotations.and_then(|a| a.get(SOFT_LATENCY_ANNOTATION)) {
                let latency = raw.parse::<i64>().map_err(|_| AppError::InvalidAnnotation {
                    annotation: SOFT_LATENCY_ANNOTATION.to_string(),
                    value: raw.clone(),
                })?;
                info!(app, latency, "Registered soft latency threshold");
                self.soft_thresholds.set(app, latency).await;
            }
        }

        Ok(())
    }

    /// Pick the best unvisited node for the app and mark it visited. When
    /// every schedulable node has been visited the cycle restarts.
    async fn choose_node(&self, app: &str, nodes: &[Node]) -> Result<String> {
        let mut visited_map = self.visited_nodes_per_app.lock().await;
        let visited = visited_map.entry(app.to_string()).or_default();

        let chosen = match score::best_node(nodes, visited) {
            Some(node) => node,
            None => {
                debug!(app, "All nodes visited, starting a new exploration cycle");
                visited.clear();
                score::best_node(nodes, visited).ok_or(AppError::NoNodesAvailable)?
            }
        };

        visited.insert(chosen.clone());
        Ok(chosen)
    }
}
