//! Per-app locks.
//!
//! Every batch that touches an app's units holds that app's lock. Locks
//! are owned by an operation id and counted, so one operation can take
//! the same app lock again (a rebalance calling moves, an auto-scale
//! tick calling a rebalance). Dropping the last guard of an app frees it
//! and queues a route rebuild for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use fleet_registry::epoch_secs;

use crate::error::{PipelineError, PipelineResult};
use crate::routes::RouteRebuildQueue;

#[derive(Debug, Clone)]
struct LockEntry {
    owner: String,
    refs: usize,
    acquired_at: u64,
}

/// Current holder of an app lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub app: String,
    pub owner: String,
    pub acquired_at: u64,
}

struct LockerState {
    entries: Mutex<HashMap<String, LockEntry>>,
    released: Notify,
    owners: AtomicU64,
    rebuilds: Option<RouteRebuildQueue>,
}

/// Shared app lock table. Cheap to clone.
#[derive(Clone)]
pub struct AppLocker {
    state: Arc<LockerState>,
}

impl AppLocker {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A locker that queues a route rebuild whenever an app is released.
    pub fn with_rebuild_queue(queue: RouteRebuildQueue) -> Self {
        Self::build(Some(queue))
    }

    fn build(rebuilds: Option<RouteRebuildQueue>) -> Self {
        Self {
            state: Arc::new(LockerState {
                entries: Mutex::new(HashMap::new()),
                released: Notify::new(),
                owners: AtomicU64::new(0),
                rebuilds,
            }),
        }
    }

    /// A fresh operation id, `{kind}-{n}`.
    pub fn new_owner(&self, kind: &str) -> String {
        let n = self.state.owners.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{kind}-{n}")
    }

    /// Take `app` for `owner` without waiting.
    pub fn try_lock(&self, app: &str, owner: &str) -> Option<AppLockGuard> {
        let mut entries = self.entries();
        match entries.get_mut(app) {
            Some(entry) if entry.owner == owner => entry.refs += 1,
            Some(_) => return None,
            None => {
                entries.insert(
                    app.to_string(),
                    LockEntry {
                        owner: owner.to_string(),
                        refs: 1,
                        acquired_at: epoch_secs(),
                    },
                );
                debug!(%app, %owner, "app locked");
            }
        }
        Some(AppLockGuard {
            locker: self.clone(),
            app: app.to_string(),
            owner: owner.to_string(),
            rebuild_routes: true,
        })
    }

    /// Take `app` for `owner`, waiting up to `timeout` for it to be free.
    pub async fn lock(
        &self,
        app: &str,
        owner: &str,
        timeout: Duration,
    ) -> PipelineResult<AppLockGuard> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let released = self.state.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(guard) = self.try_lock(app, owner) {
                return Ok(guard);
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                warn!(%app, %owner, holder = ?self.holder(app).map(|h| h.owner), "timed out waiting for app lock");
                return Err(PipelineError::AppLocked(app.to_string()));
            }
        }
    }

    pub fn holder(&self, app: &str) -> Option<LockInfo> {
        self.entries().get(app).map(|e| LockInfo {
            app: app.to_string(),
            owner: e.owner.clone(),
            acquired_at: e.acquired_at,
        })
    }

    pub fn is_locked(&self, app: &str) -> bool {
        self.entries().contains_key(app)
    }

    fn release(&self, app: &str, owner: &str, rebuild_routes: bool) {
        let freed = {
            let mut entries = self.entries();
            match entries.get_mut(app) {
                Some(entry) if entry.owner == owner => {
                    entry.refs -= 1;
                    if entry.refs == 0 {
                        entries.remove(app);
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };
        if !freed {
            return;
        }
        debug!(%app, %owner, "app unlocked");
        self.state.released.notify_waiters();
        if rebuild_routes {
            if let Some(queue) = &self.state.rebuilds {
                queue.enqueue(app);
            }
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        self.state
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for AppLocker {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one reference on an app lock until dropped.
pub struct AppLockGuard {
    locker: AppLocker,
    app: String,
    owner: String,
    rebuild_routes: bool,
}

impl AppLockGuard {
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Release without queueing a route rebuild.
    pub fn quiet(mut self) -> Self {
        self.rebuild_routes = false;
        self
    }
}

impl Drop for AppLockGuard {
    fn drop(&mut self) {
        self.locker.release(&self.app, &self.owner, self.rebuild_routes);
    }
}

impl std::fmt::Debug for AppLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppLockGuard")
            .field("app", &self.app)
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_owner_reenters_other_owner_is_refused() {
        let locker = AppLocker::new();
        let a = locker.try_lock("myapp", "op-1").unwrap();
        let b = locker.try_lock("myapp", "op-1").unwrap();
        assert!(locker.try_lock("myapp", "op-2").is_none());

        drop(a);
        assert!(locker.is_locked("myapp"));
        assert!(locker.try_lock("myapp", "op-2").is_none());

        drop(b);
        assert!(!locker.is_locked("myapp"));
        assert!(locker.try_lock("myapp", "op-2").is_some());
    }

    #[test]
    fn owners_are_unique() {
        let locker = AppLocker::new();
        assert_ne!(locker.new_owner("move"), locker.new_owner("move"));
    }

    #[tokio::test]
    async fn lock_waits_for_release() {
        let locker = AppLocker::new();
        let held = locker.try_lock("myapp", "op-1").unwrap();

        let waiter = {
            let locker = locker.clone();
            tokio::spawn(async move {
                locker
                    .lock("myapp", "op-2", Duration::from_secs(5))
                    .await
                    .map(|g| g.app().to_string())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), "myapp");
    }

    #[tokio::test]
    async fn lock_times_out() {
        let locker = AppLocker::new();
        let _held = locker.try_lock("myapp", "op-1").unwrap();
        let err = locker
            .lock("myapp", "op-2", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AppLocked(ref app) if app == "myapp"));
    }

    #[tokio::test]
    async fn concurrent_lockers_are_exclusive() {
        let locker = AppLocker::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let locker = locker.clone();
            handles.push(tokio::spawn(async move {
                locker.try_lock("myapp", &format!("op-{i}")).map(|g| g.quiet())
            }));
        }
        let mut guards = Vec::new();
        for h in handles {
            if let Some(g) = h.await.unwrap() {
                guards.push(g);
            }
        }
        assert_eq!(guards.len(), 1);
    }

    #[test]
    fn release_queues_route_rebuild() {
        let queue = RouteRebuildQueue::new();
        let locker = AppLocker::with_rebuild_queue(queue.clone());

        let guard = locker.try_lock("myapp", "op-1").unwrap();
        let again = locker.try_lock("myapp", "op-1").unwrap();
        drop(again);
        assert!(queue.pending().is_empty());
        drop(guard);
        assert_eq!(queue.pending(), vec!["myapp"]);

        drop(locker.try_lock("other", "op-2").unwrap().quiet());
        assert_eq!(queue.pending(), vec!["myapp"]);
    }
}
