//! User/cluster association store
//!
//! The authoritative mapping (user, app) -> (cluster, pod) consumed by the
//! routing manager. At most one association exists per (user, app); an
//! entry is only replaced by a strictly better sample, where "better" means
//! lower latency, or soft-valid superseding a hard-only finding.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::measurements::LatencySample;

/// Where a user's traffic for one app should land.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterInfo {
    pub cluster_name: String,
    pub pod_name: String,
    pub created_at: DateTime<Utc>,
    pub has_soft_constraint: bool,
    #[serde(rename = "latency")]
    pub latency: i64,
}

/// userID -> appName -> association
pub type AssociationMap = HashMap<String, HashMap<String, ClusterInfo>>;

#[derive(Debug, Default)]
struct AssociationState {
    data: AssociationMap,
    changed: bool,
}

#[derive(Debug, Default)]
pub struct AssociationStore {
    state: RwLock<AssociationState>,
}

impl AssociationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or improve the association for (user, app).
    ///
    /// An existing entry is replaced when the new sample has strictly lower
    /// latency, or when it is soft-valid and the entry was hard-only.
    pub async fn add_association(
        &self,
        user: &str,
        app: &str,
        cluster: &str,
        sample: &LatencySample,
        is_soft: bool,
    ) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let user_associations = state.data.entry(user.to_string()).or_default();

        match user_associations.get_mut(app) {
            Some(current) => {
                let improves = sample.measurement < current.latency
                    || (is_soft && !current.has_soft_constraint);
                if improves {
                    info!(
                        app,
                        user,
                        from = current.latency,
                        to = sample.measurement,
                        "Updating association"
                    );
                    current.cluster_name = cluster.to_string();
                    current.pod_name = sample.pod_name.clone();
                    current.latency = sample.measurement;
                    current.has_soft_constraint = is_soft;
                    current.created_at = Utc::now();
                    state.changed = true;
                } else {
                    debug!(app, user, "Existing association is at least as good");
                }
            }
            None => {
                info!(app, user, latency = sample.measurement, "New association created");
                user_associations.insert(
                    app.to_string(),
                    ClusterInfo {
                        cluster_name: cluster.to_string(),
                        pod_name: sample.pod_name.clone(),
                        created_at: Utc::now(),
                        has_soft_constraint: is_soft,
                        latency: sample.measurement,
                    },
                );
                state.changed = true;
            }
        }
    }

    pub async fn get(&self, user: &str, app: &str) -> Option<ClusterInfo> {
        let state = self.state.read().await;
        state.data.get(user)?.get(app).cloned()
    }

    pub async fn remove(&self, user: &str, app: &str) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(user_associations) = state.data.get_mut(user) {
            if user_associations.remove(app).is_some() {
                if user_associations.is_empty() {
                    state.data.remove(user);
                }
                state.changed = true;
            }
        }
    }

    /// True when some user's association for `app` names this pod. Such
    /// pods are exempt from descheduling.
    pub async fn contains_pod(&self, app: &str, pod_name: &str) -> bool {
        let state = self.state.read().await;
        state
            .data
            .values()
            .any(|apps| apps.get(app).is_some_and(|info| info.pod_name == pod_name))
    }

    pub async fn snapshot(&self) -> AssociationMap {
        self.state.read().await.data.clone()
    }

    /// Drop associations created more than `minutes` ago, pruning emptied
    /// users. Any deletion marks the store changed.
    pub async fn cleanup_older_than(&self, minutes: i64) {
        let cutoff = Utc::now() - Duration::minutes(minutes);
        let mut state = self.state.write().await;
        let mut deleted = 0usize;
        for apps in state.data.values_mut() {
            let before = apps.len();
            apps.retain(|_, info| info.created_at >= cutoff);
            deleted += before - apps.len();
        }
        state.data.retain(|_, apps| !apps.is_empty());
        if deleted > 0 {
            info!(deleted, "Expired associations cleaned up");
            state.changed = true;
        }
    }

    /// Return the current snapshot and clear the changed flag in one
    /// critical section; `None` when nothing changed since the last call.
    pub async fn snapshot_if_changed(&self) -> Option<AssociationMap> {
        let mut state = self.state.write().await;
        if !state.changed {
            return None;
        }
        state.changed = false;
        Some(state.data.clone())
    }

    /// Re-flag the store as changed, e.g. after a failed push.
    pub async fn mark_changed(&self) {
        self.state.write().await.changed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(pod: &str, latency: i64) -> LatencySample {
        LatencySample {
            pod_namespace: "default".to_string(),
            pod_name: pod.to_string(),
            measurement: latency,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_single_entry_per_user_app() {
        let store = AssociationStore::new();
        store.add_association("u1", "app", "n1", &sample("p1", 40), false).await;
        store.add_association("u1", "app", "n2", &sample("p2", 30), false).await;

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot["u1"].len(), 1);
        assert_eq!(snapshot["u1"]["app"].cluster_name, "n2");
    }

    #[tokio::test]
    async fn test_latency_monotonic_for_hard_associations() {
        let store = AssociationStore::new();
        store.add_association("u1", "app", "n1", &sample("p1", 40), false).await;
        store.add_association("u1", "app", "n2", &sample("p2", 60), false).await;

        let info = store.get("u1", "app").await.unwrap();
        assert_eq!(info.cluster_name, "n1");
        assert_eq!(info.latency, 40);

        store.add_association("u1", "app", "n3", &sample("p3", 40), false).await;
        assert_eq!(store.get("u1", "app").await.unwrap().cluster_name, "n1");
    }

    #[tokio::test]
    async fn test_soft_supersedes_hard_regardless_of_latency() {
        let store = AssociationStore::new();
        store.add_association("u1", "app", "n1", &sample("p1", 40), false).await;
        store.add_association("u1", "app", "n2", &sample("p2", 90), true).await;

        let info = store.get("u1", "app").await.unwrap();
        assert_eq!(info.cluster_name, "n2");
        assert!(info.has_soft_constraint);

        // A later hard-only finding must not displace the soft one unless
        // its latency is strictly lower.
        store.add_association("u1", "app", "n3", &sample("p3", 50), false).await;
        let info = store.get("u1", "app").await.unwrap();
        assert_eq!(info.cluster_name, "n3");
        assert!(!info.has_soft_constraint);
    }

    #[tokio::test]
    async fn test_cleanup_expires_old_entries_and_flags_change() {
        let store = AssociationStore::new();
        store.add_association("u1", "app", "n1", &sample("p1", 40), false).await;
        assert!(store.snapshot_if_changed().await.is_some());

        {
            let mut state = store.state.write().await;
            let info = state.data.get_mut("u1").unwrap().get_mut("app").unwrap();
            info.created_at = Utc::now() - Duration::minutes(6);
        }

        store.cleanup_older_than(5).await;
        let snapshot = store.snapshot_if_changed().await.expect("cleanup must flag change");
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_remove_flags_change() {
        let store = AssociationStore::new();
        store.add_association("u1", "app", "n1", &sample("p1", 40), false).await;
        store.snapshot_if_changed().await;

        store.remove("u1", "app").await;
        assert!(store.snapshot_if_changed().await.is_some());
        assert!(store.get("u1", "app").await.is_none());
    }

    #[tokio::test]
    async fn test_noop_add_does_not_flag_change() {
        let store = AssociationStore::new();
        store.add_association("u1", "app", "n1", &sample("p1", 40), false).await;
        store.snapshot_if_changed().await;

        store.add_association("u1", "app", "n2", &sample("p2", 80), false).await;
        assert!(store.snapshot_if_changed().await.is_none());
    }

    #[tokio::test]
    async fn test_contains_pod() {
        let store = AssociationStore::new();
        store.add_association("u1", "app", "n1", &sample("p1", 40), false).await;

        assert!(store.contains_pod("app", "p1").await);
        assert!(!store.contains_pod("app", "p2").await);
        assert!(!store.contains_pod("other", "p1").await);
    }

    #[test]
    fn test_cluster_info_wire_format() {
        let info = ClusterInfo {
            cluster_name: "n1".to_string(),
            pod_name: "p1".to_string(),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            has_soft_constraint: true,
            latency: 17,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["ClusterName"], "n1");
        assert_eq!(json["PodName"], "p1");
        assert_eq!(json["HasSoftConstraint"], true);
        assert_eq!(json["latency"], 17);
        assert!(json["CreatedAt"].is_string());
    }
}
