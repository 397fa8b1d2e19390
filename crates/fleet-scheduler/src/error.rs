//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur while placing or picking units.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no nodes found for pool: {0}")]
    NoNodesForPool(String),

    #[error("unbalanced metadata for node group: {0}")]
    UnbalancedMetadata(String),

    #[error("no available node: {0}")]
    NoAvailableNode(String),

    #[error("no container to remove for app {app} process {process}")]
    NoContainerToRemove { app: String, process: String },

    #[error("cluster error: {0}")]
    Cluster(#[from] fleet_registry::ClusterError),

    #[error("catalog error: {0}")]
    Catalog(#[from] anyhow::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
