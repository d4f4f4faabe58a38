//! Latency descheduler
//!
//! The closed-loop half of the controller: every tick it polls all sidecars
//! for fresh latency samples, classifies each (app, user, node) against the
//! registered thresholds, evicts pods from nodes that fail them, keeps the
//! replica count exploring new nodes, and pushes the user/cluster
//! associations to the routing manager. No error terminates the loop; the
//! next tick re-polls everything.

pub mod classify;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::k8s::{is_excluded_namespace, K8sClient};
use crate::scheduler::APP_LABEL;
use crate::store::{
    sorted_nodes_by_measurement, AssociationMap, AssociationStore, LatencySample, MeasurementMap,
    MeasurementStore, ThresholdStore,
};
use classify::{classify, soft_condition_victims, NodeClass};

pub struct Descheduler {
    k8s: K8sClient,
    config: Config,
    http: reqwest::Client,
    sched_lock: Arc<Mutex<()>>,
    measurements: Arc<MeasurementStore>,
    associations: Arc<AssociationStore>,
    invalid_nodes: MeasurementStore,
    hard_valid_nodes: MeasurementStore,
    soft_valid_nodes: MeasurementStore,
    hard_thresholds: Arc<ThresholdStore>,
    soft_thresholds: Arc<ThresholdStore>,
    default_replicas: Mutex<HashMap<String, i32>>,
}

impl Descheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        k8s: K8sClient,
        config: Config,
        sched_lock: Arc<Mutex<()>>,
        measurements: Arc<MeasurementStore>,
        associations: Arc<AssociationStore>,
        hard_thresholds: Arc<ThresholdStore>,
        soft_thresholds: Arc<ThresholdStore>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("building http client")?;

        Ok(Self {
            k8s,
            config,
            http,
            sched_lock,
            measurements,
            associations,
            invalid_nodes: MeasurementStore::new(),
            hard_valid_nodes: MeasurementStore::new(),
            soft_valid_nodes: MeasurementStore::new(),
            hard_thresholds,
            soft_thresholds,
            default_replicas: Mutex::new(HashMap::new()),
        })
    }

    /// Run the control loop forever.
    pub async fn run(&self) {
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.tick().await {
                error!(error = %e, "Descheduling pass failed");
            }
        }
    }

    /// One descheduling pass.
    async fn tick(&self) -> Result<()> {
        debug!("Collecting new measurements");
        let polled = self.poll_measurements().await?;

        self.associations
            .cleanup_older_than(self.config.association_ttl_minutes)
            .await;
        self.measurements.merge(polled).await;
        self.measurements
            .cleanup_older_than(self.config.measurement_ttl_minutes)
            .await;

        let n_tot = match self.k8s.list_nodes().await {
            Ok(nodes) => nodes.len().saturating_sub(1),
            Err(e) => {
                warn!(error = %e, "Failed to count nodes, skipping pass");
                return Ok(());
            }
        };

        let snapshot = self.measurements.snapshot().await;
        for (app, users) in &snapshot {
            let default_replicas = self.default_replicas_for(app).await;

            // Bindings and evictions must not interleave.
            let _guard = self.sched_lock.lock().await;

            for (user, nodes) in users {
                self.classify_user_nodes(app, user, nodes).await;
                if self.soft_thresholds.get(app).await.is_some() {
                    self.enforce_soft_condition(n_tot, app, user).await;
                }
            }

            if let Some(default_replicas) = default_replicas {
                self.manage_replicas(app, default_replicas).await;
            }
        }

        if let Some(snapshot) = self.associations.snapshot_if_changed().await {
            if let Err(e) = self.push_associations(&snapshot).await {
                error!(error = %e, "Failed to push associations to the routing manager");
                self.associations.mark_changed().await;
            }
        } else {
            debug!("Associations unchanged");
        }

        Ok(())
    }

    /// Poll every eligible pod's sidecar for its latest samples, keyed by
    /// (app, user, node). Unreachable or malformed sidecars are skipped.
    async fn poll_measurements(&self) -> Result<MeasurementMap> {
        let pods = self.k8s.list_all_pods().await?;
        let mut measurements: MeasurementMap = MeasurementMap::new();

        for pod in pods {
            let namespace = pod.metadata.namespace.clone().unwrap_or_default();
            if is_excluded_namespace(&namespace) {
                continue;
            }
            let Some(ip) = pod_ip(&pod) else {
                continue;
            };
            let Some(pod_name) = pod.metadata.name.clone() else {
                continue;
            };
            let Some(node_name) = pod.spec.as_ref().and_then(|spec| spec.node_name.clone()) else {
                continue;
            };
            let Some(app) = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(APP_LABEL))
                .cloned()
            else {
                debug!(pod = %pod_name, "Pod has no app label, skipping");
                continue;
            };

            let endpoint = format!("http://{ip}:{}/measurements", self.config.sidecar_port);
            debug!(endpoint = %endpoint, "Contacting sidecar");

            let response = match self.http.get(&endpoint).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(pod = %pod_name, error = %e, "Sidecar unreachable");
                    continue;
                }
            };
            let samples: HashMap<String, LatencySample> = match response.json().await {
                Ok(samples) => samples,
                Err(e) => {
                    warn!(pod = %pod_name, error = %e, "Malformed measurements payload");
                    continue;
                }
            };

            for (user, sample) in samples {
                let user_measurements = measurements
                    .entry(app.clone())
                    .or_default()
                    .entry(user)
                    .or_default();
                match user_measurements.get(&node_name) {
                    Some(existing) if existing.timestamp >= sample.timestamp => {}
                    _ => {
                        user_measurements.insert(node_name.clone(), sample);
                    }
                }
            }
        }

        Ok(measurements)
    }

    /// Classify each node sample for (app, user), keep the class views and
    /// the association in step, and evict pods from invalid nodes.
    async fn classify_user_nodes(
        &self,
        app: &str,
        user: &str,
        nodes: &HashMap<String, LatencySample>,
    ) {
        let hard = self.hard_thresholds.get(app).await;
        let soft = self.soft_thresholds.get(app).await;

        for (node, sample) in nodes {
            match classify(hard, soft, sample.measurement) {
                Some(NodeClass::SoftValid) => {
                    self.invalid_nodes.delete(app, user, node).await;
                    self.hard_valid_nodes.delete(app, user, node).await;
                    self.soft_valid_nodes.add(app, user, node, sample.clone()).await;
                    self.associations
                        .add_association(user, app, node, sample, true)
                        .await;
                }
                Some(NodeClass::HardValid) => {
                    self.invalid_nodes.delete(app, user, node).await;
                    self.soft_valid_nodes.delete(app, user, node).await;
                    self.hard_valid_nodes.add(app, user, node, sample.clone()).await;
                    self.associations
                        .add_association(user, app, node, sample, false)
                        .await;
                }
                Some(NodeClass::Invalid) => {
                    info!(%node, user, app, "Node exceeds the hard latency bound");
                    self.measurements.delete(app, user, node).await;
                    self.invalid_nodes.delete(app, user, node).await;
                    self.hard_valid_nodes.delete(app, user, node).await;
                    self.soft_valid_nodes.delete(app, user, node).await;
                    self.associations.remove(user, app).await;
                    match self.deschedule_all_pods_per_node(app, node).await {
                        Ok(count) => debug!(%node, count, "Descheduled pods from invalid node"),
                        Err(e) => warn!(%node, error = %e, "Failed to deschedule pods"),
                    }
                }
                None => {
                    warn!(app, %node, "No latency threshold registered, sample left unclassified");
                }
            }
        }
    }

    /// While more than half the schedulable nodes are still candidates,
    /// deschedule the worst hard-only nodes so fresh ones can be probed.
    async fn enforce_soft_condition(&self, n_tot: usize, app: &str, user: &str) {
        let hard_only = self.hard_valid_nodes.user_nodes(app, user).await;
        let sorted = sorted_nodes_by_measurement(&hard_only);
        let n_soft = self.soft_valid_nodes.count_for(app, user).await;

        let (victims, protected) = soft_condition_victims(&sorted, n_soft, n_tot);
        for node in &victims {
            debug!(%node, user, "Soft condition holds, descheduling worst hard-only node");
            if let Some(current) = self.associations.get(user, app).await {
                if current.cluster_name == *node {
                    self.associations.remove(user, app).await;
                }
            }
            if let Err(e) = self.deschedule_all_pods_per_node(app, node).await {
                warn!(%node, error = %e, "Failed to deschedule pods");
                break;
            }
            self.measurements.delete(app, user, node).await;
            self.hard_valid_nodes.delete(app, user, node).await;
        }

        // The best surviving hard-only node keeps the user routable in case
        // the eviction above dropped its association.
        if let Some(node) = protected {
            if let Some(sample) = self.hard_valid_nodes.get(app, user, &node).await {
                self.associations
                    .add_association(user, app, &node, &sample, false)
                    .await;
            }
        }
    }

    /// Delete every pod of `app` on `node` that is not protected: system
    /// namespaces, pods already terminating and user-bound pods survive.
    /// Returns the number of pods deleted.
    pub async fn deschedule_all_pods_per_node(&self, app: &str, node: &str) -> Result<usize> {
        let pods = self.k8s.list_pods_on_node(node).await?;
        let mut descheduled = 0;

        for pod in pods {
            let namespace = pod.metadata.namespace.clone().unwrap_or_default();
            if is_excluded_namespace(&namespace) {
                continue;
            }
            if pod_ip(&pod).is_none() {
                continue;
            }
            let Some(name) = pod.metadata.name.clone() else {
                continue;
            };
            let pod_app = pod.metadata.labels.as_ref().and_then(|labels| labels.get(APP_LABEL));
            if pod_app.map(String::as_str) != Some(app) {
                continue;
            }
            if pod.metadata.deletion_timestamp.is_some() {
                continue;
            }
            if self.associations.contains_pod(app, &name).await {
                debug!(pod = %name, "Pod is associated to a user, undeschedulable for now");
                continue;
            }

            match self.k8s.delete_pod(&namespace, &name).await {
                Ok(()) => descheduled += 1,
                Err(e) => warn!(pod = %name, error = %e, "Failed to delete pod"),
            }
        }

        Ok(descheduled)
    }

    /// The replica count the app's deployment declared before this
    /// controller started scaling it, captured on first sight.
    async fn default_replicas_for(&self, app: &str) -> Option<i32> {
        let mut defaults = self.default_replicas.lock().await;
        if let Some(replicas) = defaults.get(app) {
            return Some(*replicas);
        }
        match self.k8s.deployment_replicas(app).await {
            Ok(replicas) => {
                info!(app, replicas, "Recorded default replica count");
                defaults.insert(app.to_string(), replicas);
                Some(replicas)
            }
            Err(e) => {
                warn!(app, error = %e, "Failed to read deployment replicas");
                None
            }
        }
    }

    /// Grow the deployment when every pod serves an associated user, shrink
    /// it back towards the default while surplus pods sit unassociated.
    async fn manage_replicas(&self, app: &str, default_replicas: i32) {
        if self.all_pods_assigned(app).await {
            info!(app, "All pods assigned to users, increasing the replica set");
            if let Err(e) = self.k8s.adjust_replicas(app, 1).await {
                warn!(app, error = %e, "Failed to increase replicas");
            }
            return;
        }

        let current = match self.k8s.deployment_replicas(app).await {
            Ok(current) => current,
            Err(e) => {
                warn!(app, error = %e, "Failed to read deployment replicas");
                return;
            }
        };
        if current > default_replicas {
            if let Err(e) = self.deschedule_unassociated_pod(app).await {
                warn!(app, error = %e, "Failed to shrink the replica set");
            }
        }
    }

    /// True when every running pod of the app is named by some association.
    async fn all_pods_assigned(&self, app: &str) -> bool {
        let pods = match self.k8s.list_pods_by_app(app).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(app, error = %e, "Failed to list pods");
                return false;
            }
        };

        let mut seen = false;
        for pod in &pods {
            if pod_ip(pod).is_none() || pod.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let Some(name) = pod.metadata.name.as_deref() else {
                continue;
            };
            seen = true;
            if !self.associations.contains_pod(app, name).await {
                debug!(pod = %name, "Pod is not associated to any user");
                return false;
            }
        }
        seen
    }

    /// Remove one surplus probe pod: pause the deployment, drop one
    /// replica, delete an unassociated pod, resume. Requires at least two
    /// unassociated pods so one probe always survives.
    async fn deschedule_unassociated_pod(&self, app: &str) -> Result<()> {
        let pods = self.k8s.list_pods_by_app(app).await?;
        let mut unassociated: Vec<&Pod> = Vec::new();
        for pod in &pods {
            let Some(name) = pod.metadata.name.as_deref() else {
                continue;
            };
            if pod.metadata.deletion_timestamp.is_some() {
                continue;
            }
            if !self.associations.contains_pod(app, name).await {
                unassociated.push(pod);
            }
        }

        if unassociated.len() < 2 {
            return Ok(());
        }

        // Keep the first probe pod, remove the next one.
        let victim = unassociated[1];
        let namespace = victim.metadata.namespace.clone().unwrap_or_default();
        let Some(name) = victim.metadata.name.clone() else {
            return Ok(());
        };

        self.k8s.set_deployment_paused(app, true).await?;
        self.k8s.adjust_replicas(app, -1).await?;
        self.k8s.delete_pod(&namespace, &name).await?;
        self.k8s.set_deployment_paused(app, false).await?;

        info!(app, pod = %name, "Removed surplus unassociated pod");
        Ok(())
    }

    /// POST the association snapshot to the routing manager.
    async fn push_associations(&self, snapshot: &AssociationMap) -> Result<()> {
        let endpoint = format!(
            "{}/update-associations",
            self.config.router_endpoint.trim_end_matches('/')
        );
        info!(endpoint = %endpoint, "Sending association data to the routing manager");

        let response = self.http.post(&endpoint).json(snapshot).send().await?;
        if !response.status().is_success() {
            bail!("routing manager returned {}", response.status());
        }

        info!("Associations successfully sent to the routing manager");
        Ok(())
    }
}

fn pod_ip(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()
        .and_then(|status| status.pod_ip.clone())
        .filter(|ip| !ip.is_empty())
}
