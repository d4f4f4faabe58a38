//! Deduplicating, rate-limited work queue
//!
//! Pod keys enter from the watcher and are handed to the scheduling worker
//! one at a time. A key already waiting is not enqueued twice; failed keys
//! come back after a per-key exponential backoff.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

const BASE_DELAY: Duration = Duration::from_millis(200);
const MAX_DELAY: Duration = Duration::from_secs(30);

pub struct WorkQueue {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
    waiting: Mutex<HashSet<String>>,
    retries: Mutex<HashMap<String, u32>>,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            waiting: Mutex::new(HashSet::new()),
            retries: Mutex::new(HashMap::new()),
        })
    }

    /// Enqueue a key unless it is already waiting.
    pub async fn add(&self, key: String) {
        let mut waiting = self.waiting.lock().await;
        if waiting.insert(key.clone()) {
            let _ = self.tx.send(key);
        }
    }

    /// Re-enqueue a failed key after its next backoff interval.
    pub async fn add_rate_limited(self: &Arc<Self>, key: String) {
        let attempt = {
            let mut retries = self.retries.lock().await;
            let attempt = retries.entry(key.clone()).or_insert(0);
            *attempt += 1;
            *attempt
        };
        let delay = backoff_for(attempt);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Clear the retry history of a successfully processed key.
    pub async fn forget(&self, key: &str) {
        self.retries.lock().await.remove(key);
    }

    /// Wait for the next key. Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<String> {
        let key = self.rx.lock().await.recv().await?;
        self.waiting.lock().await.remove(&key);
        Some(key)
    }
}

fn backoff_for(attempt: u32) -> Duration {
    BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_keys_collapse() {
        let queue = WorkQueue::new();
        queue.add("default/p1".to_string()).await;
        queue.add("default/p1".to_string()).await;
        queue.add("default/p2".to_string()).await;

        assert_eq!(queue.next().await.unwrap(), "default/p1");
        assert_eq!(queue.next().await.unwrap(), "default/p2");

        // Once popped, the key may be enqueued again.
        queue.add("default/p1".to_string()).await;
        assert_eq!(queue.next().await.unwrap(), "default/p1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_requeue_comes_back() {
        let queue = WorkQueue::new();
        queue.add_rate_limited("default/p1".to_string()).await;

        tokio::time::advance(MAX_DELAY).await;
        assert_eq!(queue.next().await.unwrap(), "default/p1");
    }

    #[tokio::test]
    async fn test_forget_resets_backoff() {
        let queue = WorkQueue::new();
        {
            let mut retries = queue.retries.lock().await;
            retries.insert("default/p1".to_string(), 7);
        }
        queue.forget("default/p1").await;
        assert!(queue.retries.lock().await.is_empty());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert!(backoff_for(1) < backoff_for(2));
        assert!(backoff_for(2) < backoff_for(5));
        assert_eq!(backoff_for(30), MAX_DELAY);
    }
}
