//! Cluster — the registry facade the rest of the system talks to.
//!
//! Wraps the `StateStore` with node/unit semantics (creation status
//! filtering, registration rules) and routes runtime calls to nodes
//! through the per-node action limiter.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use fleet_core::ContainerRuntime;

use crate::error::{ClusterError, ClusterResult, StateError};
use crate::limiter::ActionLimiter;
use crate::store::StateStore;
use crate::types::*;

/// Upper bound on a single container runtime call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared handle on the cluster registry. Cheap to clone.
#[derive(Clone)]
pub struct Cluster {
    store: StateStore,
    runtime: Arc<dyn ContainerRuntime>,
    limiter: ActionLimiter,
    call_timeout: Duration,
    legacy_rule: Option<AutoScaleRule>,
}

impl Cluster {
    pub fn new(store: StateStore, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            store,
            runtime,
            limiter: ActionLimiter::new(0),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            legacy_rule: None,
        }
    }

    /// Bound concurrent runtime operations per node.
    pub fn with_action_limit(mut self, limit: usize) -> Self {
        self.limiter = ActionLimiter::new(limit);
        self
    }

    /// Bound the duration of every runtime call made through [`Cluster::run_on_node`].
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Rule applied to pools with neither their own nor a stored default rule.
    pub fn with_legacy_rule(mut self, rule: Option<AutoScaleRule>) -> Self {
        self.legacy_rule = rule;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn limiter(&self) -> &ActionLimiter {
        &self.limiter
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Nodes whose creation status is `created`.
    pub fn nodes(&self) -> ClusterResult<Vec<Node>> {
        let mut nodes = self.unfiltered_nodes()?;
        nodes.retain(|n| n.creation_status == CreationStatus::Created);
        Ok(nodes)
    }

    /// Every registered node, including pending, disabled and errored ones.
    pub fn unfiltered_nodes(&self) -> ClusterResult<Vec<Node>> {
        let mut nodes = self.store.list_nodes()?;
        nodes.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(nodes)
    }

    /// Created nodes in `pool`.
    pub fn pool_nodes(&self, pool: &str) -> ClusterResult<Vec<Node>> {
        let mut nodes = self.nodes()?;
        nodes.retain(|n| n.pool() == pool);
        Ok(nodes)
    }

    /// Every node whose metadata contains all of `filter`.
    pub fn unfiltered_nodes_for_metadata(
        &self,
        filter: &HashMap<String, String>,
    ) -> ClusterResult<Vec<Node>> {
        let mut nodes = self.unfiltered_nodes()?;
        nodes.retain(|n| n.matches_metadata(filter));
        Ok(nodes)
    }

    pub fn get_node(&self, address: &str) -> ClusterResult<Node> {
        self.store
            .get_node(address)?
            .ok_or_else(|| ClusterError::NodeNotFound(address.to_string()))
    }

    /// Add a node. Fails if the address is already present or the node
    /// has no pool.
    pub fn register(&self, node: &Node) -> ClusterResult<()> {
        if node.pool().is_empty() {
            return Err(ClusterError::InvalidNode(format!(
                "node {} has no {POOL_METADATA} metadata",
                node.address
            )));
        }
        match self.store.insert_node(node) {
            Ok(()) => {
                info!(address = %node.address, pool = %node.pool(), status = ?node.creation_status, "node registered");
                Ok(())
            }
            Err(StateError::AlreadyExists(addr)) => Err(ClusterError::NodeAlreadyRegistered(addr)),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace a node's metadata and status by address.
    pub fn update_node(&self, node: &Node) -> ClusterResult<()> {
        match self.store.update_node(node) {
            Ok(()) => {
                debug!(address = %node.address, status = ?node.creation_status, "node updated");
                Ok(())
            }
            Err(StateError::NotFound(_)) => Err(ClusterError::NodeNotFound(node.address.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a node's creation status, recording `error` alongside.
    pub fn set_node_status(
        &self,
        address: &str,
        status: CreationStatus,
        error: Option<String>,
    ) -> ClusterResult<Node> {
        let mut node = self.get_node(address)?;
        node.creation_status = status;
        node.creation_error = error;
        self.update_node(&node)?;
        Ok(node)
    }

    /// Deregister a node. Its units must have been evacuated already.
    pub fn remove_node(&self, address: &str) -> ClusterResult<Node> {
        let node = self.get_node(address)?;
        self.store.delete_node(address)?;
        info!(%address, pool = %node.pool(), "node removed");
        Ok(node)
    }

    // ── Containers ─────────────────────────────────────────────────

    pub fn list_containers(&self, filter: &ContainerFilter) -> ClusterResult<Vec<Container>> {
        Ok(self.store.list_containers(filter)?)
    }

    pub fn get_container(&self, id: &str) -> ClusterResult<Container> {
        self.store
            .get_container(id)?
            .ok_or_else(|| ClusterError::ContainerNotFound(id.to_string()))
    }

    /// Record a new unit on its node. Fails if the node is not registered.
    pub fn add_container(&self, container: &Container) -> ClusterResult<()> {
        match self.store.insert_container(container) {
            Ok(()) => Ok(()),
            Err(StateError::NotFound(_)) => {
                Err(ClusterError::NodeNotFound(container.host_addr.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_container(&self, container: &Container) -> ClusterResult<()> {
        match self.store.update_container(container) {
            Ok(()) => Ok(()),
            Err(StateError::NotFound(_)) => Err(ClusterError::ContainerNotFound(container.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop a unit record. Missing records are not an error.
    pub fn remove_container(&self, id: &str) -> ClusterResult<bool> {
        Ok(self.store.delete_container(id)?)
    }

    /// Units per node address, for every address in `nodes` (empty lists included).
    pub fn containers_by_node(
        &self,
        nodes: &[Node],
        filter: &ContainerFilter,
    ) -> ClusterResult<HashMap<String, Vec<Container>>> {
        let mut by_node: HashMap<String, Vec<Container>> = nodes
            .iter()
            .map(|n| (n.address.clone(), Vec::new()))
            .collect();
        for c in self.store.list_containers(filter)? {
            if let Some(list) = by_node.get_mut(&c.host_addr) {
                list.push(c);
            }
        }
        Ok(by_node)
    }

    // ── Auto-scale rules ───────────────────────────────────────────

    /// The rule governing `pool`: its own, else the stored default (`""`),
    /// else the legacy one. Returned as stored, without validation.
    pub fn autoscale_rule(&self, pool: &str) -> ClusterResult<Option<AutoScaleRule>> {
        if let Some(rule) = self.store.get_rule(pool)? {
            return Ok(Some(rule));
        }
        if let Some(rule) = self.store.get_rule("")? {
            return Ok(Some(rule));
        }
        Ok(self.legacy_rule.clone())
    }

    /// Stored rules, with the legacy rule listed under `""` when no
    /// default is stored.
    pub fn autoscale_rules(&self) -> ClusterResult<Vec<AutoScaleRule>> {
        let mut rules = self.store.list_rules()?;
        if !rules.iter().any(|r| r.metadata_filter.is_empty()) {
            if let Some(legacy) = &self.legacy_rule {
                rules.insert(0, legacy.clone());
            }
        }
        Ok(rules)
    }

    // ── Runtime ────────────────────────────────────────────────────

    /// Run `op` against the container runtime at `address`, holding a
    /// slot of that node's action limiter for the duration. The call is
    /// abandoned after the cluster's call timeout.
    pub async fn run_on_node<T, F, Fut>(&self, address: &str, op: F) -> ClusterResult<T>
    where
        F: FnOnce(Arc<dyn ContainerRuntime>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let _permit = self.limiter.start(address).await;
        match tokio::time::timeout(self.call_timeout, op(self.runtime.clone())).await {
            Ok(result) => result.map_err(|source| ClusterError::Runtime {
                node: address.to_string(),
                source,
            }),
            Err(_) => {
                warn!(
                    node = %address,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "runtime call timed out"
                );
                Err(ClusterError::Timeout {
                    node: address.to_string(),
                    timeout: self.call_timeout,
                })
            }
        }
    }

    /// Check that the container engine at `address` answers.
    pub async fn ping(&self, address: &str) -> ClusterResult<()> {
        let addr = address.to_string();
        self.run_on_node(address, |rt| async move { rt.ping(&addr).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::memory::MemoryRuntime;

    fn test_cluster() -> (Cluster, Arc<MemoryRuntime>) {
        let runtime = Arc::new(MemoryRuntime::new());
        let cluster = Cluster::new(StateStore::open_in_memory().unwrap(), runtime.clone());
        (cluster, runtime)
    }

    fn test_container(id: &str, host: &str) -> Container {
        Container {
            id: id.to_string(),
            name: id.to_string(),
            app_name: "myapp".to_string(),
            process_name: "web".to_string(),
            image_id: "registry/myapp:v1".to_string(),
            host_addr: host.to_string(),
            host_port: "30001".to_string(),
            ip: "172.17.0.2".to_string(),
            status: ContainerStatus::Started,
            last_status_update: 0,
        }
    }

    #[test]
    fn nodes_hides_non_created() {
        let (cluster, _) = test_cluster();
        cluster.register(&Node::new("n1", "p1")).unwrap();
        cluster
            .register(&Node::new("n2", "p1").with_status(CreationStatus::Pending))
            .unwrap();
        cluster
            .register(&Node::new("n3", "p1").with_status(CreationStatus::Error))
            .unwrap();

        let created: Vec<String> = cluster.nodes().unwrap().into_iter().map(|n| n.address).collect();
        assert_eq!(created, vec!["n1"]);
        assert_eq!(cluster.unfiltered_nodes().unwrap().len(), 3);
    }

    #[test]
    fn register_rejects_duplicates_and_missing_pool() {
        let (cluster, _) = test_cluster();
        cluster.register(&Node::new("n1", "p1")).unwrap();
        assert!(matches!(
            cluster.register(&Node::new("n1", "p1")),
            Err(ClusterError::NodeAlreadyRegistered(_))
        ));
        assert!(matches!(
            cluster.register(&Node::new("n2", "")),
            Err(ClusterError::InvalidNode(_))
        ));
    }

    #[test]
    fn pending_node_transitions_to_created() {
        let (cluster, _) = test_cluster();
        cluster
            .register(&Node::new("n1", "p1").with_status(CreationStatus::Pending))
            .unwrap();
        assert!(cluster.pool_nodes("p1").unwrap().is_empty());

        cluster
            .set_node_status("n1", CreationStatus::Created, None)
            .unwrap();
        assert_eq!(cluster.pool_nodes("p1").unwrap().len(), 1);
    }

    #[test]
    fn remove_unknown_node_is_not_found() {
        let (cluster, _) = test_cluster();
        let err = cluster.remove_node("nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn container_host_must_be_registered() {
        let (cluster, _) = test_cluster();
        assert!(matches!(
            cluster.add_container(&test_container("c1", "n1")),
            Err(ClusterError::NodeNotFound(_))
        ));
        cluster.register(&Node::new("n1", "p1")).unwrap();
        cluster.add_container(&test_container("c1", "n1")).unwrap();
        assert_eq!(cluster.get_container("c1").unwrap().host_addr, "n1");
    }

    #[test]
    fn containers_by_node_includes_empty_nodes() {
        let (cluster, _) = test_cluster();
        cluster.register(&Node::new("n1", "p1")).unwrap();
        cluster.register(&Node::new("n2", "p1")).unwrap();
        cluster.add_container(&test_container("c1", "n1")).unwrap();

        let nodes = cluster.nodes().unwrap();
        let by_node = cluster
            .containers_by_node(&nodes, &ContainerFilter::default())
            .unwrap();
        assert_eq!(by_node["n1"].len(), 1);
        assert!(by_node["n2"].is_empty());
    }

    #[tokio::test]
    async fn run_on_node_wraps_runtime_errors() {
        let (cluster, runtime) = test_cluster();
        runtime.set_unreachable("n1", true).await;

        let err = cluster.ping("n1").await.unwrap_err();
        assert!(matches!(err, ClusterError::Runtime { ref node, .. } if node == "n1"));
        assert!(cluster.ping("n2").await.is_ok());
    }

    #[tokio::test]
    async fn run_on_node_gives_up_on_hung_calls() {
        let (cluster, runtime) = test_cluster();
        let cluster = cluster.with_call_timeout(Duration::from_millis(50));
        runtime.set_hang_pings(true);

        let err = tokio::time::timeout(Duration::from_secs(5), cluster.ping("n1"))
            .await
            .expect("ping returned within the call timeout")
            .unwrap_err();
        assert!(matches!(err, ClusterError::Timeout { ref node, .. } if node == "n1"));
        assert!(err.to_string().contains("timed out after 50ms"));
    }

    fn rule(pool: &str, count: u32) -> AutoScaleRule {
        AutoScaleRule {
            metadata_filter: pool.to_string(),
            enabled: true,
            max_container_count: count,
            max_memory_ratio: 0.0,
            scale_down_ratio: 2.0,
            prevent_rebalance: false,
        }
    }

    #[test]
    fn autoscale_rule_prefers_pool_then_default_then_legacy() {
        let (cluster, _) = test_cluster();
        assert!(cluster.autoscale_rule("p1").unwrap().is_none());

        let cluster = cluster.with_legacy_rule(Some(rule("", 7)));
        assert_eq!(cluster.autoscale_rule("p1").unwrap().unwrap().max_container_count, 7);

        cluster.store().put_rule(&rule("", 5)).unwrap();
        assert_eq!(cluster.autoscale_rule("p1").unwrap().unwrap().max_container_count, 5);

        cluster.store().put_rule(&rule("p1", 3)).unwrap();
        assert_eq!(cluster.autoscale_rule("p1").unwrap().unwrap().max_container_count, 3);
        assert_eq!(cluster.autoscale_rule("p2").unwrap().unwrap().max_container_count, 5);
    }

    #[test]
    fn autoscale_rules_list_legacy_only_without_stored_default() {
        let (cluster, _) = test_cluster();
        let cluster = cluster.with_legacy_rule(Some(rule("", 9)));
        cluster.store().put_rule(&rule("p1", 3)).unwrap();

        let rules = cluster.autoscale_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].metadata_filter, "");
        assert_eq!(rules[0].max_container_count, 9);

        cluster.store().put_rule(&rule("", 4)).unwrap();
        let rules = cluster.autoscale_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().any(|r| r.metadata_filter.is_empty() && r.max_container_count == 4));
    }
}
