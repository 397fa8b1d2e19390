//! The auto-scale loop.
//!
//! One [`Autoscaler`] per process. [`Autoscaler::run`] ticks every
//! `autoscale.interval`; [`Autoscaler::run_once`] runs one tick on demand
//! and streams its log to a [`Progress`].

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use fleet_core::config::AutoScaleConfig;
use fleet_core::{IaasDriver, Progress};
use fleet_pipeline::{AppLockGuard, Provisioner};
use fleet_registry::{
    AutoScaleRule, ContainerFilter, CreationStatus, EventRecord, EventTarget, IAAS_METADATA, Node,
    POOL_METADATA, StateStore, epoch_nanos,
};
use fleet_scheduler::choose_metadata_from_nodes;

use crate::error::{AutoscaleError, AutoscaleResult};
use crate::rule::normalize_rule;
use crate::scaler::{PoolState, Scaler};

/// Event kind of auto-scale records.
pub const EVENT_KIND: &str = "autoscale";

/// Pools scaled at the same time within one tick.
const POOL_CONCURRENCY: usize = 4;

const PING_INTERVAL: Duration = Duration::from_millis(200);

// ── Event log ──────────────────────────────────────────────────────

/// Log lines of one pool tick. Lines also go to tracing and the caller's
/// progress stream.
#[derive(Clone)]
struct EventLog {
    pool: String,
    lines: Arc<Mutex<Vec<String>>>,
    progress: Progress,
}

impl EventLog {
    fn new(pool: &str, progress: Progress) -> Self {
        Self {
            pool: pool.to_string(),
            lines: Arc::new(Mutex::new(Vec::new())),
            progress,
        }
    }

    fn log(&self, line: impl Into<String>) {
        let line = line.into();
        debug!(pool = %self.pool, "{line}");
        self.progress.message(format!("{line}\n"));
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line);
    }

    fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Custom data attached to an auto-scale event.
#[derive(Debug, Default, Serialize)]
struct EventData {
    result: Option<crate::scaler::ScalerResult>,
    nodes: Vec<Node>,
    rule: Option<AutoScaleRule>,
}

// ── Autoscaler ─────────────────────────────────────────────────────

struct Inner {
    provisioner: Provisioner,
    iaas: Arc<dyn IaasDriver>,
    config: AutoScaleConfig,
    running: Mutex<HashSet<String>>,
    cancel: watch::Sender<bool>,
}

/// Periodic node auto-scaler. Cheap to clone.
#[derive(Clone)]
pub struct Autoscaler {
    inner: Arc<Inner>,
}

/// Marks a pool as being scaled until dropped.
struct PoolGuard {
    scaler: Autoscaler,
    pool: String,
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.scaler.running().remove(&self.pool);
    }
}

impl Autoscaler {
    /// Rules come from the provisioner's cluster, which also carries the
    /// legacy rule of `config` (see [`fleet_registry::Cluster::with_legacy_rule`]).
    pub fn new(provisioner: Provisioner, iaas: Arc<dyn IaasDriver>, config: AutoScaleConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                provisioner,
                iaas,
                config,
                running: Mutex::new(HashSet::new()),
                cancel,
            }),
        }
    }

    pub fn config(&self) -> &AutoScaleConfig {
        &self.inner.config
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.inner.provisioner
    }

    fn store(&self) -> &StateStore {
        self.inner.provisioner.cluster().store()
    }

    /// Stored rules, plus the legacy one when no default is stored.
    pub fn rules(&self) -> AutoscaleResult<Vec<AutoScaleRule>> {
        Ok(self.inner.provisioner.cluster().autoscale_rules()?)
    }

    /// Auto-scale events, newest first.
    pub fn history(&self, limit: usize) -> AutoscaleResult<Vec<EventRecord>> {
        Ok(self.store().list_events(EVENT_KIND, limit)?)
    }

    /// Run the loop until `shutdown` flips. A tick in flight is allowed to
    /// finish, but any wait for a new machine is cut short.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.inner.config.interval();
        info!(interval_secs = interval.as_secs(), "autoscaler started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let discard = Progress::discard();
                    let tick = self.run_once(&discard);
                    tokio::pin!(tick);
                    let result = tokio::select! {
                        result = &mut tick => result,
                        _ = shutdown.changed() => {
                            info!("shutdown requested, cancelling machine waits");
                            self.inner.cancel.send_replace(true);
                            let result = tick.await;
                            if let Err(e) = result {
                                error!(error = %e, "autoscaler tick failed");
                            }
                            break;
                        }
                    };
                    if let Err(e) = result {
                        error!(error = %e, "autoscaler tick failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("autoscaler shutting down");
    }

    /// One tick over every pool with created or pending nodes.
    pub async fn run_once(&self, progress: &Progress) -> AutoscaleResult<()> {
        let mut pools: BTreeMap<String, Vec<Node>> = BTreeMap::new();
        for node in self.inner.provisioner.cluster().unfiltered_nodes()? {
            if node.pool().is_empty() {
                debug!(address = %node.address, "skipped node without pool");
                continue;
            }
            if !matches!(
                node.creation_status,
                CreationStatus::Created | CreationStatus::Pending
            ) {
                continue;
            }
            pools.entry(node.pool().to_string()).or_default().push(node);
        }

        let limit = Arc::new(Semaphore::new(POOL_CONCURRENCY));
        let mut tasks = JoinSet::new();
        for (pool, nodes) in pools {
            let this = self.clone();
            let progress = progress.clone();
            let limit = limit.clone();
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await.ok();
                this.run_pool(pool, nodes, progress).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "pool scaler task failed");
            }
        }
        Ok(())
    }

    fn running(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_start_pool(&self, pool: &str) -> Option<PoolGuard> {
        if !self.running().insert(pool.to_string()) {
            return None;
        }
        Some(PoolGuard {
            scaler: self.clone(),
            pool: pool.to_string(),
        })
    }

    /// Scale one pool and record the event, unless nothing happened.
    async fn run_pool(&self, pool: String, nodes: Vec<Node>, progress: Progress) {
        let Some(_running) = self.try_start_pool(&pool) else {
            debug!(%pool, "running scaler deferred, pool already being scaled");
            return;
        };
        let start_nanos = epoch_nanos();
        let log = EventLog::new(&pool, progress.clone());
        let mut data = EventData::default();

        let error = match self.scale_pool(&pool, &nodes, &log, &mut data, &progress).await {
            Ok(()) => None,
            Err(e) => {
                warn!(%pool, error = %e, "auto scale failed");
                log.log(e.to_string());
                Some(e.to_string())
            }
        };
        let nothing_done = match &data.result {
            None => error.is_none(),
            Some(result) => result.is_noop(),
        };
        if nothing_done {
            log.log(format!("nothing to do for \"{POOL_METADATA}\": {pool:?}"));
            return;
        }

        let record = EventRecord {
            target: EventTarget::pool(&pool),
            kind: EVENT_KIND.to_string(),
            start_nanos,
            end_nanos: epoch_nanos(),
            error,
            log: log.lines(),
            custom_data: serde_json::to_value(&data).unwrap_or_default(),
        };
        if let Err(e) = self.store().append_event(&record) {
            error!(%pool, error = %e, "unable to record auto scale event");
        }
    }

    async fn scale_pool(
        &self,
        pool: &str,
        nodes: &[Node],
        log: &EventLog,
        data: &mut EventData,
        progress: &Progress,
    ) -> AutoscaleResult<()> {
        let Some(rule) = self.inner.provisioner.cluster().autoscale_rule(pool)? else {
            log.log(format!("no auto scale rule for {pool}"));
            return Ok(());
        };
        if !rule.enabled {
            log.log(format!("auto scale rule disabled for {pool}"));
            return Ok(());
        }
        data.rule = Some(rule.clone());
        let rule = normalize_rule(rule)?;
        data.rule = Some(rule.clone());

        let scaler = Scaler::for_rule(&rule, &self.inner.config.total_memory_metadata);
        log.log(format!(
            "running scaler {} for \"{POOL_METADATA}\": {pool:?}",
            scaler.kind()
        ));

        let locker = self.inner.provisioner.locker();
        let owner = locker.new_owner(&format!("autoscale-{pool}"));
        let _locks = match self.lock_pool_apps(nodes, &owner) {
            Ok(locks) => locks,
            Err(e @ AutoscaleError::AppNotLocked(_)) => {
                log.log(format!("aborting scaler for now, gonna retry later: {e}"));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let state = self.pool_state(pool, nodes, scaler.needs_memory()).await?;
        let result = scaler.scale(&state)?;
        let to_add = result.to_add;
        let to_remove = result.to_remove.clone();
        let wants_rebalance = result.to_rebalance;
        let rebalance_only = result.is_rebalance_only();
        data.result = Some(result);

        if to_add > 0 {
            log.log(format!(
                "running event \"add\" for {pool:?}: {to_add} node(s), {}",
                data.result.as_ref().map(|r| r.reason.as_str()).unwrap_or("")
            ));
            let (added, err) = self.add_nodes(pool, nodes, to_add, log).await;
            data.nodes = added;
            if let Some(err) = err {
                if data.nodes.is_empty() {
                    return Err(err);
                }
                log.log(format!("not all required nodes were created: {err}"));
            }
        } else if !to_remove.is_empty() {
            log.log(format!(
                "running event \"remove\" for {pool:?}: {} node(s), {}",
                to_remove.len(),
                data.result.as_ref().map(|r| r.reason.as_str()).unwrap_or("")
            ));
            data.nodes = to_remove.clone();
            self.remove_nodes(&owner, &to_remove, log, progress).await?;
        }

        if to_remove.is_empty() && !rule.prevent_rebalance && (to_add > 0 || wants_rebalance) {
            let force = !data.nodes.is_empty();
            match self
                .inner
                .provisioner
                .rebalance_pool(&owner, pool, force, progress)
                .await
            {
                Ok(moved) => {
                    if let Some(result) = data.result.as_mut() {
                        result.to_rebalance = moved;
                    }
                }
                Err(e) if rebalance_only => return Err(e.into()),
                Err(e) => log.log(format!("unable to rebalance: {e}")),
            }
        }
        Ok(())
    }

    /// Take every app with units on `nodes` for `owner`, without waiting.
    fn lock_pool_apps(&self, nodes: &[Node], owner: &str) -> AutoscaleResult<Vec<AppLockGuard>> {
        let cluster = self.inner.provisioner.cluster();
        let units = cluster.list_containers(
            &ContainerFilter::default().with_hosts(nodes.iter().map(|n| n.address.clone()).collect()),
        )?;
        let apps: BTreeSet<String> = units.into_iter().map(|u| u.app_name).collect();

        let locker = self.inner.provisioner.locker();
        let mut guards = Vec::with_capacity(apps.len());
        for app in apps {
            match locker.try_lock(&app, owner) {
                Some(guard) => guards.push(guard.quiet()),
                None => return Err(AutoscaleError::AppNotLocked(app)),
            }
        }
        Ok(guards)
    }

    async fn pool_state(
        &self,
        pool: &str,
        nodes: &[Node],
        with_memory: bool,
    ) -> AutoscaleResult<PoolState> {
        let units = self
            .inner
            .provisioner
            .cluster()
            .containers_by_node(nodes, &ContainerFilter::default())?;
        let mut state = PoolState {
            pool: pool.to_string(),
            nodes: nodes.to_vec(),
            units,
            ..PoolState::default()
        };
        if !with_memory {
            return Ok(state);
        }

        let catalog = self.inner.provisioner.catalog();
        let apps: BTreeSet<String> = state
            .units
            .values()
            .flatten()
            .map(|u| u.app_name.clone())
            .collect();
        for app in apps {
            let info = catalog.app(&app).await.map_err(AutoscaleError::Catalog)?;
            state.app_memory.insert(app, info.plan.memory);
        }
        let plans = catalog.plans().await.map_err(AutoscaleError::Catalog)?;
        state.max_plan = match plans.iter().map(|p| p.memory).max() {
            Some(max) => Some(max),
            None => catalog
                .default_plan()
                .await
                .map_err(AutoscaleError::Catalog)?
                .map(|p| p.memory),
        };
        Ok(state)
    }

    // ── Adding nodes ───────────────────────────────────────────────

    /// Create `count` nodes in parallel. Returns the nodes that made it
    /// and the first failure, if any.
    async fn add_nodes(
        &self,
        pool: &str,
        model: &[Node],
        count: usize,
        log: &EventLog,
    ) -> (Vec<Node>, Option<AutoscaleError>) {
        let mut tasks = JoinSet::new();
        for _ in 0..count {
            let this = self.clone();
            let pool = pool.to_string();
            let model = model.to_vec();
            let log = log.clone();
            tasks.spawn(async move { this.add_node(&pool, &model, &log).await });
        }

        let mut added = Vec::new();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(node)) => added.push(node),
                Ok(Err(e)) => {
                    warn!(%pool, error = %e, "node creation failed");
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(AutoscaleError::Iaas(e.into()));
                    }
                }
            }
        }
        added.sort_by(|a: &Node, b: &Node| a.address.cmp(&b.address));
        (added, failure)
    }

    async fn add_node(&self, pool: &str, model: &[Node], log: &EventLog) -> AutoscaleResult<Node> {
        let mut metadata = choose_metadata_from_nodes(model)?;
        let Some(iaas) = metadata.get(IAAS_METADATA).cloned() else {
            return Err(AutoscaleError::NoIaasMetadata(format!("{metadata:?}")));
        };
        metadata.insert(POOL_METADATA.to_string(), pool.to_string());

        let timeout = self.inner.config.machine_timeout();
        let machine = match tokio::time::timeout(
            timeout,
            self.inner.iaas.create_machine(&iaas, &metadata),
        )
        .await
        {
            Ok(created) => created.map_err(AutoscaleError::Iaas)?,
            Err(_) => {
                return Err(AutoscaleError::Iaas(anyhow::anyhow!(
                    "timed out after {}ms on {iaas}",
                    timeout.as_millis()
                )));
            }
        };
        log.log(format!(
            "new machine created: {} - Waiting for docker to start...",
            machine.address
        ));

        let cluster = self.inner.provisioner.cluster();
        let node = Node {
            address: machine.address.clone(),
            metadata,
            creation_status: CreationStatus::Pending,
            creation_error: None,
            iaas_id: Some(machine.id.clone()),
        };
        if let Err(e) = cluster.register(&node) {
            self.destroy_machine(&machine.id).await;
            return Err(e.into());
        }

        match self.wait_for_node(&node.address).await {
            Ok(()) => {
                let node = cluster.set_node_status(&node.address, CreationStatus::Created, None)?;
                log.log(format!("new machine created: {} - started!", node.address));
                info!(%pool, address = %node.address, machine = %machine.id, "node added");
                Ok(node)
            }
            Err(reason) => {
                cluster.set_node_status(&node.address, CreationStatus::Error, Some(reason.clone()))?;
                self.destroy_machine(&machine.id).await;
                Err(AutoscaleError::NodeNotReady {
                    address: node.address,
                    reason,
                })
            }
        }
    }

    /// Ping `address` until it answers, `wait_new_machine` passes or the
    /// loop shuts down. No single ping outlives the deadline.
    async fn wait_for_node(&self, address: &str) -> Result<(), String> {
        let timeout = self.inner.config.wait_new_machine();
        let deadline = tokio::time::Instant::now() + timeout;
        let cluster = self.inner.provisioner.cluster();
        let mut cancel = self.inner.cancel.subscribe();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let last = tokio::select! {
                answered = tokio::time::timeout(remaining, cluster.ping(address)) => match answered {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "ping did not answer".to_string(),
                },
                _ = cancel.wait_for(|cancelled| *cancelled) => {
                    return Err("cancelled by shutdown".to_string());
                }
            };
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(format!(
                    "timed out after {}ms waiting for node: {last}",
                    timeout.as_millis()
                ));
            }
            tokio::select! {
                _ = tokio::time::sleep(PING_INTERVAL.min(deadline - now)) => {}
                _ = cancel.wait_for(|cancelled| *cancelled) => {
                    return Err("cancelled by shutdown".to_string());
                }
            }
        }
    }

    async fn destroy_machine(&self, id: &str) {
        let timeout = self.inner.config.machine_timeout();
        match tokio::time::timeout(timeout, self.inner.iaas.delete_machine(id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(machine = %id, error = %e, "unable to delete machine"),
            Err(_) => warn!(
                machine = %id,
                timeout_ms = timeout.as_millis() as u64,
                "machine deletion timed out"
            ),
        }
    }

    // ── Removing nodes ─────────────────────────────────────────────

    /// Drain and drop `nodes` one by one, stopping at the first failure.
    async fn remove_nodes(
        &self,
        owner: &str,
        nodes: &[Node],
        log: &EventLog,
        progress: &Progress,
    ) -> AutoscaleResult<()> {
        if let Some(node) = nodes.iter().find(|n| n.iaas().is_none()) {
            return Err(AutoscaleError::NoIaasMetadata(format!(
                "node {} {:?}",
                node.address, node.metadata
            )));
        }

        let cluster = self.inner.provisioner.cluster();
        for node in nodes {
            cluster.set_node_status(&node.address, CreationStatus::Disabled, None)?;
            if let Err(e) = self
                .inner
                .provisioner
                .move_containers(owner, &node.address, None, progress)
                .await
            {
                cluster.set_node_status(&node.address, node.creation_status, None)?;
                return Err(e.into());
            }
            cluster.remove_node(&node.address)?;
            if let Some(id) = &node.iaas_id {
                self.destroy_machine(id).await;
            }
            log.log(format!("node {} removed", node.address));
            info!(address = %node.address, "node removed by auto scale");
        }
        Ok(())
    }
}
