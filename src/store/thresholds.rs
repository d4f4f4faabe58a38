//! Per-app latency thresholds
//!
//! Two instances exist at runtime, one for the hard bound and one for the
//! soft bound. The scheduler registers values from pod annotations; the
//! descheduler only reads.

use std::collections::HashMap;

use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct ThresholdStore {
    data: RwLock<HashMap<String, i64>>,
}

impl ThresholdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, app: &str, latency_ms: i64) {
        self.data.write().await.insert(app.to_string(), latency_ms);
    }

    pub async fn get(&self, app: &str) -> Option<i64> {
        self.data.read().await.get(app).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = ThresholdStore::new();
        assert_eq!(store.get("app").await, None);

        store.set("app", 50).await;
        assert_eq!(store.get("app").await, Some(50));
        assert_eq!(store.get("other").await, None);
    }
}
