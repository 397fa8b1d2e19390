//! Route rebuilds.
//!
//! The routes an app should have are the addresses of its started units.
//! [`Provisioner::rebuild_routes`] diffs that set against the router and
//! converges it, adding before removing. When a rebuild fails, the app is
//! handed to the [`RouteRebuildQueue`], whose background worker retries it
//! under the app lock until it converges.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use fleet_registry::{ContainerFilter, ContainerStatus};

use crate::error::PipelineResult;
use crate::provisioner::Provisioner;

/// Outcome of one rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl RebuildResult {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Diff a desired route set against the current one.
pub fn diff_routes(desired: &BTreeSet<String>, current: &BTreeSet<String>) -> RebuildResult {
    RebuildResult {
        added: desired.difference(current).cloned().collect(),
        removed: current.difference(desired).cloned().collect(),
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    dirty: HashSet<String>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    wake: Notify,
}

/// Deduplicating queue of apps whose routes need a rebuild. Cheap to clone.
#[derive(Clone)]
pub struct RouteRebuildQueue {
    inner: Arc<QueueInner>,
}

impl RouteRebuildQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
            }),
        }
    }

    /// Queue `app` unless it is already waiting, and wake the worker.
    pub fn enqueue(&self, app: &str) {
        if self.push(app) {
            self.inner.wake.notify_one();
        }
    }

    /// Queue `app` for the next retry round without waking the worker.
    fn requeue(&self, app: &str) {
        self.push(app);
    }

    fn push(&self, app: &str) -> bool {
        let mut state = self.state();
        if !state.queued.insert(app.to_string()) {
            return false;
        }
        state.queue.push_back(app.to_string());
        true
    }

    /// Drop any pending rebuild of `app`, e.g. because it was deleted.
    pub fn cancel(&self, app: &str) {
        let mut state = self.state();
        state.queued.remove(app);
        state.queue.retain(|a| a != app);
        state.dirty.remove(app);
    }

    pub fn pop(&self) -> Option<String> {
        let mut state = self.state();
        let app = state.queue.pop_front()?;
        state.queued.remove(&app);
        Some(app)
    }

    /// Apps waiting for a rebuild, in queue order.
    pub fn pending(&self) -> Vec<String> {
        self.state().queue.iter().cloned().collect()
    }

    /// Apps whose last rebuild failed, sorted.
    pub fn dirty_apps(&self) -> Vec<String> {
        let mut apps: Vec<String> = self.state().dirty.iter().cloned().collect();
        apps.sort();
        apps
    }

    fn mark_dirty(&self, app: &str) {
        self.state().dirty.insert(app.to_string());
    }

    fn mark_clean(&self, app: &str) {
        self.state().dirty.remove(app);
    }

    async fn woken(&self) {
        self.inner.wake.notified().await;
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RouteRebuildQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Provisioner {
    /// Converge the router on the addresses of `app`'s started units.
    ///
    /// With `dry` set, only computes the diff.
    pub async fn rebuild_routes(&self, app: &str, dry: bool) -> PipelineResult<RebuildResult> {
        let started = self.cluster().list_containers(
            &ContainerFilter::app(app).with_statuses(vec![ContainerStatus::Started]),
        )?;
        let desired: BTreeSet<String> = started.iter().map(|c| c.address()).collect();
        let current: BTreeSet<String> = self
            .route(self.router().routes(app))
            .await?
            .into_iter()
            .collect();

        let result = diff_routes(&desired, &current);
        if dry || result.is_noop() {
            return Ok(result);
        }
        if !result.added.is_empty() {
            self.route(self.router().add_routes(app, &result.added))
                .await?;
        }
        if !result.removed.is_empty() {
            self.route(self.router().remove_routes(app, &result.removed))
                .await?;
        }
        info!(%app, added = result.added.len(), removed = result.removed.len(), "routes rebuilt");
        Ok(result)
    }

    /// Rebuild now; on failure hand the app to the background queue.
    /// A rebuild that succeeds drops whatever retry was still queued.
    pub async fn rebuild_routes_or_enqueue(&self, app: &str) {
        match self.rebuild_routes(app, false).await {
            Ok(_) => self.rebuild_queue().cancel(app),
            Err(err) => {
                warn!(%app, error = %err, "route rebuild failed, queueing retry");
                self.rebuild_queue().mark_dirty(app);
                self.rebuild_queue().enqueue(app);
            }
        }
    }

    /// Background worker draining the rebuild queue until `shutdown` flips.
    ///
    /// Failed rebuilds, and apps locked by another operation, are retried
    /// every `route_rebuild_interval`.
    pub async fn run_route_rebuilds(&self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.rebuild_queue().clone();
        let interval = self.config().route_rebuild_interval();
        info!(interval_ms = interval.as_millis() as u64, "route rebuild worker started");

        loop {
            let mut retry = Vec::new();
            while let Some(app) = queue.pop() {
                if !self.rebuild_queued(&app).await {
                    retry.push(app);
                }
            }
            for app in &retry {
                queue.requeue(app);
            }

            tokio::select! {
                _ = queue.woken() => {}
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("route rebuild worker shutting down");
                    return;
                }
            }
        }
    }

    /// One queued rebuild. Returns whether the app is done.
    async fn rebuild_queued(&self, app: &str) -> bool {
        let owner = self.locker().new_owner("routes-rebuild");
        let Some(guard) = self.locker().try_lock(app, &owner) else {
            debug!(%app, "app locked, deferring route rebuild");
            return false;
        };
        let guard = guard.quiet();
        let result = self.rebuild_routes(app, false).await;
        drop(guard);

        match result {
            Ok(_) => {
                self.rebuild_queue().mark_clean(app);
                true
            }
            Err(err) => {
                warn!(%app, error = %err, "queued route rebuild failed");
                self.rebuild_queue().mark_dirty(app);
                false
            }
        }
    }
}
