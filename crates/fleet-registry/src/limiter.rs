//! Per-node action limiter.
//!
//! Bounds how many runtime operations run against one node at a time.
//! Semaphores are created lazily per address and live as long as the
//! limiter.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

#[derive(Clone, Default)]
pub struct ActionLimiter {
    /// Max concurrent operations per node. 0 disables limiting.
    limit: usize,
    slots: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl ActionLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Wait for a slot on `node`. The slot is released when the permit drops.
    pub async fn start(&self, node: &str) -> Option<OwnedSemaphorePermit> {
        if self.limit == 0 {
            return None;
        }
        let semaphore = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(node.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.limit)))
                .clone()
        };
        semaphore.acquire_owned().await.ok()
    }

    /// Operations currently holding a slot on `node`.
    pub async fn in_flight(&self, node: &str) -> usize {
        let slots = self.slots.lock().await;
        slots
            .get(node)
            .map(|s| self.limit - s.available_permits())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn unlimited_hands_out_no_permits() {
        let limiter = ActionLimiter::new(0);
        assert!(limiter.start("n1").await.is_none());
        assert_eq!(limiter.in_flight("n1").await, 0);
    }

    #[tokio::test]
    async fn limit_blocks_until_release() {
        let limiter = ActionLimiter::new(1);
        let first = limiter.start("n1").await;
        assert!(first.is_some());
        assert_eq!(limiter.in_flight("n1").await, 1);

        // Other nodes are independent.
        assert!(limiter.start("n2").await.is_some());

        let blocked = tokio::time::timeout(Duration::from_millis(50), limiter.start("n1")).await;
        assert!(blocked.is_err());

        drop(first);
        let second = tokio::time::timeout(Duration::from_millis(50), limiter.start("n1")).await;
        assert!(second.unwrap().is_some());
    }
}
