//! Segregated scheduler — picks the node for each new unit.
//!
//! Placement order:
//! 1. keep only created nodes of the app's pool (and `to_host`, if forced)
//! 2. drop nodes over their memory budget (optional)
//! 3. pick the failure-domain group holding the fewest units of the app
//! 4. inside it, pick the node with the fewest units of the app's process
//!
//! Ties fall back to the total unit count, then to address order.
//! Placements handed out but not yet recorded in the registry are kept
//! as pending and counted like real units until released.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use fleet_core::config::SchedulerConfig;
use fleet_core::{AppCatalog, AppInfo};
use fleet_registry::{Cluster, Container, ContainerFilter, Node};

use crate::error::{SchedulerError, SchedulerResult};
use crate::metadata::split_metadata;

const MEGABYTE: f64 = 1024.0 * 1024.0;

/// One placement question.
#[derive(Debug, Clone)]
pub struct ScheduleRequest<'a> {
    pub app: &'a AppInfo,
    pub process: &'a str,
    /// Force the unit onto this node.
    pub to_host: Option<&'a str>,
    /// Units left out of the counts, usually the ones being moved away.
    pub ignored: &'a [String],
}

/// A reserved slot on a node, held until [`Scheduler::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub token: u64,
    pub node: String,
    pub app: String,
    pub process: String,
}

#[derive(Debug, Default, Clone, Copy)]
struct NodeLoad {
    app: usize,
    app_process: usize,
    total: usize,
}

#[derive(Default)]
struct PendingState {
    next_token: u64,
    placements: HashMap<u64, Placement>,
}

/// Stateful scheduler shared by every pipeline batch.
pub struct Scheduler {
    cluster: Cluster,
    catalog: Arc<dyn AppCatalog>,
    config: SchedulerConfig,
    /// Also serves as the host mutex: counts are read and the placement
    /// reserved under the same guard.
    pending: Mutex<PendingState>,
}

impl Scheduler {
    pub fn new(cluster: Cluster, catalog: Arc<dyn AppCatalog>, config: SchedulerConfig) -> Self {
        Self {
            cluster,
            catalog,
            config,
            pending: Mutex::new(PendingState::default()),
        }
    }

    /// Choose a node for one new unit and reserve it.
    pub async fn schedule(&self, req: &ScheduleRequest<'_>) -> SchedulerResult<Placement> {
        let mut pending = self.pending.lock().await;
        let pool = req.app.pool.as_str();

        let mut nodes = self.cluster.pool_nodes(pool)?;
        if nodes.is_empty() {
            return Err(SchedulerError::NoNodesForPool(pool.to_string()));
        }
        if let Some(host) = req.to_host {
            nodes.retain(|n| n.address == host);
            if nodes.is_empty() {
                return Err(SchedulerError::NoAvailableNode(format!(
                    "node {host} is not a created node of pool {pool}"
                )));
            }
        }

        let filter = ContainerFilter {
            hosts: nodes.iter().map(|n| n.address.clone()).collect(),
            exclude_ids: req.ignored.to_vec(),
            ..ContainerFilter::default()
        };
        let containers = self.cluster.list_containers(&filter)?;
        let in_flight: Vec<Placement> = pending.placements.values().cloned().collect();

        let nodes = self
            .filter_by_memory(req.app, nodes, &containers, &in_flight)
            .await?;
        let chosen = choose_node(&nodes, pool, &containers, &in_flight, &req.app.name, req.process)?;

        pending.next_token += 1;
        let placement = Placement {
            token: pending.next_token,
            node: chosen,
            app: req.app.name.clone(),
            process: req.process.to_string(),
        };
        pending.placements.insert(placement.token, placement.clone());
        debug!(
            app = %placement.app,
            process = %placement.process,
            node = %placement.node,
            "unit scheduled"
        );
        Ok(placement)
    }

    /// Drop a reservation, once its unit is recorded or its creation failed.
    pub async fn release(&self, placement: &Placement) {
        self.pending.lock().await.placements.remove(&placement.token);
    }

    /// Reservations currently held.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.placements.len()
    }

    /// Pick `count` units of `(app, process)` to remove, least useful first.
    pub fn choose_containers_to_remove(
        &self,
        app: &str,
        process: &str,
        count: usize,
    ) -> SchedulerResult<Vec<Container>> {
        let candidates = self
            .cluster
            .list_containers(&ContainerFilter::app(app).with_process(process))?;
        if candidates.len() < count {
            return Err(SchedulerError::NoContainerToRemove {
                app: app.to_string(),
                process: process.to_string(),
            });
        }
        let hosts: Vec<String> = candidates.iter().map(|c| c.host_addr.clone()).collect();
        let on_nodes = self
            .cluster
            .list_containers(&ContainerFilter::default().with_hosts(hosts))?;
        Ok(order_for_removal(candidates, &on_nodes, count))
    }

    async fn filter_by_memory(
        &self,
        app: &AppInfo,
        nodes: Vec<Node>,
        containers: &[Container],
        in_flight: &[Placement],
    ) -> SchedulerResult<Vec<Node>> {
        let ratio = self.config.max_memory_ratio;
        let key = &self.config.total_memory_metadata;
        if ratio <= 0.0 || key.is_empty() {
            return Ok(nodes);
        }

        let mut plan_memory: HashMap<String, u64> = HashMap::new();
        plan_memory.insert(app.name.clone(), app.plan.memory);
        let mut reserved: HashMap<&str, u64> = HashMap::new();
        let units = containers
            .iter()
            .map(|c| (c.host_addr.as_str(), c.app_name.as_str()))
            .chain(in_flight.iter().map(|p| (p.node.as_str(), p.app.as_str())));
        for (host, app_name) in units {
            let memory = match plan_memory.get(app_name) {
                Some(m) => *m,
                None => {
                    let m = self.catalog.app(app_name).await?.plan.memory;
                    plan_memory.insert(app_name.to_string(), m);
                    m
                }
            };
            *reserved.entry(host).or_default() += memory;
        }

        let mut fitting = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let total: f64 = node
                .metadata
                .get(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);
            if total == 0.0 {
                fitting.push(node.clone());
                continue;
            }
            let max_memory = total * ratio;
            let node_reserved = reserved.get(node.address.as_str()).copied().unwrap_or(0);
            if (node_reserved + app.plan.memory) as f64 > max_memory {
                warn!(
                    node = %node.address,
                    limit_mb = max_memory / MEGABYTE,
                    reserved_mb = node_reserved as f64 / MEGABYTE,
                    needed_mb = app.plan.memory as f64 / MEGABYTE,
                    "node has reached its memory limit"
                );
                continue;
            }
            fitting.push(node.clone());
        }

        if !fitting.is_empty() {
            return Ok(fitting);
        }
        let msg = format!(
            "no nodes found with enough memory for container of {:?}: {:.4}MB",
            app.name,
            app.plan.memory as f64 / MEGABYTE
        );
        if self.autoscale_enabled(&app.pool)? {
            warn!("{msg}. Will ignore memory restrictions.");
            return Ok(nodes);
        }
        Err(SchedulerError::NoAvailableNode(msg))
    }

    fn autoscale_enabled(&self, pool: &str) -> SchedulerResult<bool> {
        let rule = self.cluster.autoscale_rule(pool)?;
        Ok(rule.is_some_and(|r| r.enabled))
    }
}

/// Pure placement decision over a snapshot.
///
/// `candidates` may span pools; only nodes of `pool` are considered.
pub fn choose_node(
    candidates: &[Node],
    pool: &str,
    containers: &[Container],
    pending: &[Placement],
    app: &str,
    process: &str,
) -> SchedulerResult<String> {
    let nodes: Vec<Node> = candidates.iter().filter(|n| n.pool() == pool).cloned().collect();
    if nodes.is_empty() {
        return Err(SchedulerError::NoNodesForPool(pool.to_string()));
    }

    let mut loads: HashMap<&str, NodeLoad> =
        nodes.iter().map(|n| (n.address.as_str(), NodeLoad::default())).collect();
    let units = containers
        .iter()
        .map(|c| (c.host_addr.as_str(), c.app_name.as_str(), c.process_name.as_str()))
        .chain(pending.iter().map(|p| (p.node.as_str(), p.app.as_str(), p.process.as_str())));
    for (host, unit_app, unit_process) in units {
        if let Some(load) = loads.get_mut(host) {
            load.total += 1;
            if unit_app == app {
                load.app += 1;
                if unit_process == process {
                    load.app_process += 1;
                }
            }
        }
    }

    let split = split_metadata(&nodes)?;
    let groups: Vec<Vec<&str>> = if split.exclusive.is_empty() {
        vec![nodes.iter().map(|n| n.address.as_str()).collect()]
    } else {
        split
            .exclusive
            .iter()
            .map(|g| g.nodes.iter().map(String::as_str).collect())
            .collect()
    };

    let group = groups
        .iter()
        .min_by_key(|g| group_key(g, &loads))
        .ok_or_else(|| SchedulerError::NoAvailableNode(format!("no candidate groups in pool {pool}")))?;

    group
        .iter()
        .min_by_key(|addr| {
            let load = loads[*addr];
            (load.app_process, load.total, **addr)
        })
        .map(|addr| addr.to_string())
        .ok_or_else(|| SchedulerError::NoAvailableNode(format!("empty node group in pool {pool}")))
}

/// Groups with fewer units of the app go first, then fewer units overall.
fn group_key<'a>(group: &[&'a str], loads: &HashMap<&str, NodeLoad>) -> (usize, usize, &'a str) {
    let load = |addr: &str| loads.get(addr).copied().unwrap_or_default();
    let app_units: usize = group.iter().map(|a| load(*a).app).sum();
    let total: usize = group.iter().map(|a| load(*a).total).sum();
    let first = group.iter().min().copied().unwrap_or("");
    (app_units, total, first)
}

/// Order `candidates` for removal and keep the first `count`.
///
/// Least useful status first (created, building, error, stopped, ...,
/// started). Among equals, units on the node most loaded with the same
/// app/process go first, so removal also evens out the distribution.
/// `on_nodes` lists every unit on the candidates' nodes.
pub fn order_for_removal(
    mut candidates: Vec<Container>,
    on_nodes: &[Container],
    count: usize,
) -> Vec<Container> {
    let mut same_kind: HashMap<String, usize> = HashMap::new();
    let mut totals: HashMap<String, usize> = HashMap::new();
    for c in on_nodes {
        *totals.entry(c.host_addr.clone()).or_default() += 1;
    }
    for c in &candidates {
        *same_kind.entry(c.host_addr.clone()).or_default() += 1;
    }

    let mut chosen = Vec::with_capacity(count.min(candidates.len()));
    while chosen.len() < count && !candidates.is_empty() {
        let idx = candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                let ka = same_kind.get(&a.host_addr).copied().unwrap_or(0);
                let kb = same_kind.get(&b.host_addr).copied().unwrap_or(0);
                let ta = totals.get(&a.host_addr).copied().unwrap_or(0);
                let tb = totals.get(&b.host_addr).copied().unwrap_or(0);
                a.status
                    .removal_priority()
                    .cmp(&b.status.removal_priority())
                    .then(kb.cmp(&ka))
                    .then(tb.cmp(&ta))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|(i, _)| i);
        let Some(idx) = idx else { break };
        let picked = candidates.swap_remove(idx);
        if let Some(k) = same_kind.get_mut(&picked.host_addr) {
            *k = k.saturating_sub(1);
        }
        if let Some(t) = totals.get_mut(&picked.host_addr) {
            *t = t.saturating_sub(1);
        }
        chosen.push(picked);
    }
    chosen
}
