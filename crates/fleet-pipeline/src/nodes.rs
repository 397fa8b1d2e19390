//! Registering and deregistering nodes by hand.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::info;

use fleet_core::Progress;
use fleet_registry::{ClusterError, ContainerFilter, CreationStatus, Node, POOL_METADATA};

use crate::error::{PipelineError, PipelineResult};
use crate::provisioner::Provisioner;

/// A node an operator asks to add.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeRequest {
    pub address: String,
    pub pool: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Provisioner {
    /// Ping the node's runtime, then register it as created.
    pub async fn add_node(&self, request: NodeRequest) -> PipelineResult<Node> {
        let address = request.address.trim();
        if address.is_empty() {
            return Err(PipelineError::InvalidRequest("address is required".to_string()));
        }
        if request.pool.is_empty() {
            return Err(PipelineError::InvalidRequest("pool is required".to_string()));
        }

        let mut node = Node::new(address, &request.pool);
        for (key, value) in &request.metadata {
            if key != POOL_METADATA {
                node = node.with_metadata(key, value);
            }
        }
        node.creation_status = CreationStatus::Created;

        self.cluster().ping(address).await.map_err(|e| {
            PipelineError::InvalidRequest(format!("node {address} is unreachable: {e}"))
        })?;
        match self.cluster().register(&node) {
            Ok(()) => Ok(node),
            Err(e @ (ClusterError::NodeAlreadyRegistered(_) | ClusterError::InvalidNode(_))) => {
                Err(PipelineError::InvalidRequest(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deregister a node. With `rebalance`, its units are moved to the rest
    /// of the pool first; without it, a node that still holds units is
    /// refused.
    pub async fn remove_node(
        &self,
        owner: &str,
        address: &str,
        rebalance: bool,
        progress: &Progress,
    ) -> PipelineResult<Node> {
        let node = self.cluster().get_node(address)?;
        if rebalance {
            self.cluster()
                .set_node_status(address, CreationStatus::Disabled, None)?;
            if let Err(e) = self.move_containers(owner, address, None, progress).await {
                self.cluster()
                    .set_node_status(address, node.creation_status, node.creation_error.clone())?;
                return Err(e);
            }
        } else {
            let left = self.cluster().list_containers(&ContainerFilter::host(address))?;
            if !left.is_empty() {
                return Err(PipelineError::InvalidRequest(format!(
                    "node {address} still has {} units, remove them or rebalance",
                    left.len()
                )));
            }
        }
        let removed = self.cluster().remove_node(address)?;
        info!(%address, pool = %removed.pool(), rebalance, "node deregistered");
        Ok(removed)
    }
}
