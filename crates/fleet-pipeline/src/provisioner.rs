//! The provisioner: everything a unit operation needs, in one handle.

use std::future::Future;
use std::sync::Arc;

use fleet_core::config::{PipelineConfig, SchedulerConfig};
use fleet_core::{AppCatalog, AppInfo, Router};
use fleet_registry::{Cluster, LogConfig};
use fleet_scheduler::Scheduler;

use crate::error::{PipelineError, PipelineResult};
use crate::locker::{AppLockGuard, AppLocker};
use crate::routes::RouteRebuildQueue;

struct Inner {
    cluster: Cluster,
    scheduler: Scheduler,
    router: Arc<dyn Router>,
    catalog: Arc<dyn AppCatalog>,
    locker: AppLocker,
    rebuilds: RouteRebuildQueue,
    config: PipelineConfig,
}

/// Shared handle on the unit pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Provisioner {
    inner: Arc<Inner>,
}

impl Provisioner {
    pub fn new(
        cluster: Cluster,
        catalog: Arc<dyn AppCatalog>,
        router: Arc<dyn Router>,
        scheduler_config: SchedulerConfig,
        config: PipelineConfig,
    ) -> Self {
        let cluster = cluster
            .with_action_limit(config.node_action_limit)
            .with_call_timeout(config.runtime_timeout());
        let scheduler = Scheduler::new(cluster.clone(), catalog.clone(), scheduler_config);
        let rebuilds = RouteRebuildQueue::new();
        let locker = AppLocker::with_rebuild_queue(rebuilds.clone());
        Self {
            inner: Arc::new(Inner {
                cluster,
                scheduler,
                router,
                catalog,
                locker,
                rebuilds,
                config,
            }),
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.inner.cluster
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.inner.router
    }

    pub fn catalog(&self) -> &Arc<dyn AppCatalog> {
        &self.inner.catalog
    }

    pub fn locker(&self) -> &AppLocker {
        &self.inner.locker
    }

    pub fn rebuild_queue(&self) -> &RouteRebuildQueue {
        &self.inner.rebuilds
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub(crate) async fn app(&self, name: &str) -> PipelineResult<AppInfo> {
        self.inner
            .catalog
            .app(name)
            .await
            .map_err(PipelineError::Catalog)
    }

    pub(crate) async fn lock_app(&self, app: &str, owner: &str) -> PipelineResult<AppLockGuard> {
        self.inner
            .locker
            .lock(app, owner, self.inner.config.lock_wait_timeout())
            .await
    }

    /// Await one router call, bounded by the configured router timeout.
    pub(crate) async fn route<T>(
        &self,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> PipelineResult<T> {
        let timeout = self.inner.config.router_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result.map_err(PipelineError::Router),
            Err(_) => Err(PipelineError::Router(anyhow::anyhow!(
                "router call timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Log settings for new units in `pool`: the pool's own, else the default.
    pub fn log_config_for(&self, pool: &str) -> PipelineResult<Option<LogConfig>> {
        let store = self.inner.cluster.store();
        match store.get_log_config(pool)? {
            Some(config) => Ok(Some(config)),
            None => Ok(store.get_log_config("")?),
        }
    }
}
