//! Latency measurement store
//!
//! Holds the latest latency sample per (app, user, node) triple. Sidecars
//! produce samples, the descheduler merges and classifies them.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// A single end-to-end latency sample taken by a pod's sidecar.
///
/// Field names on the wire match the sidecar's `/measurements` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LatencySample {
    pub pod_namespace: String,
    pub pod_name: String,
    /// Measured request latency in milliseconds.
    pub measurement: i64,
    pub timestamp: DateTime<Utc>,
}

/// appName -> userID -> nodeName -> latest sample
pub type MeasurementMap = HashMap<String, HashMap<String, HashMap<String, LatencySample>>>;

#[derive(Debug, Default)]
pub struct MeasurementStore {
    data: RwLock<MeasurementMap>,
}

impl MeasurementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample for (app, user, node). An existing sample is only
    /// replaced when the incoming timestamp is strictly newer.
    pub async fn add(&self, app: &str, user: &str, node: &str, sample: LatencySample) {
        let mut data = self.data.write().await;
        let user_measurements = data
            .entry(app.to_string())
            .or_default()
            .entry(user.to_string())
            .or_default();
        match user_measurements.get(node) {
            Some(existing) if existing.timestamp >= sample.timestamp => {}
            _ => {
                user_measurements.insert(node.to_string(), sample);
            }
        }
    }

    pub async fn delete(&self, app: &str, user: &str, node: &str) {
        let mut data = self.data.write().await;
        if let Some(user_measurements) = data.get_mut(app).and_then(|users| users.get_mut(user)) {
            user_measurements.remove(node);
        }
    }

    pub async fn get(&self, app: &str, user: &str, node: &str) -> Option<LatencySample> {
        let data = self.data.read().await;
        data.get(app)?.get(user)?.get(node).cloned()
    }

    /// All samples currently held for one (app, user).
    pub async fn user_nodes(&self, app: &str, user: &str) -> HashMap<String, LatencySample> {
        let data = self.data.read().await;
        data.get(app)
            .and_then(|users| users.get(user))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count_for(&self, app: &str, user: &str) -> usize {
        let data = self.data.read().await;
        data.get(app)
            .and_then(|users| users.get(user))
            .map(|nodes| nodes.len())
            .unwrap_or(0)
    }

    pub async fn snapshot(&self) -> MeasurementMap {
        self.data.read().await.clone()
    }

    /// Fold a polled measurement map in, sample by sample, keeping the
    /// newest timestamp per key.
    pub async fn merge(&self, new_measurements: MeasurementMap) {
        for (app, users) in new_measurements {
            for (user, nodes) in users {
                for (node, sample) in nodes {
                    self.add(&app, &user, &node, sample).await;
                }
            }
        }
    }

    /// Drop samples older than `minutes`, then prune emptied user and app
    /// sub-maps.
    pub async fn cleanup_older_than(&self, minutes: i64) {
        let cutoff = Utc::now() - Duration::minutes(minutes);
        let mut data = self.data.write().await;
        for users in data.values_mut() {
            for nodes in users.values_mut() {
                nodes.retain(|_, sample| sample.timestamp >= cutoff);
            }
            users.retain(|_, nodes| !nodes.is_empty());
        }
        data.retain(|_, users| !users.is_empty());
    }
}

/// Node names ordered worst-first for the soft-condition pass: highest
/// latency first, ties broken by older timestamp.
pub fn sorted_nodes_by_measurement(nodes: &HashMap<String, LatencySample>) -> Vec<String> {
    let mut infos: Vec<(&String, &LatencySample)> = nodes.iter().collect();
    infos.sort_by(|(_, a), (_, b)| {
        b.measurement
            .cmp(&a.measurement)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
    infos.into_iter().map(|(name, _)| name.clone()).collect()
}
