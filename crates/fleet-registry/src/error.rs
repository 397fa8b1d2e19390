//! Error types for the cluster registry.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),
}

/// Result type alias for registry facade operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors raised by [`Cluster`](crate::Cluster).
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("node already registered: {0}")]
    NodeAlreadyRegistered(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("invalid node: {0}")]
    InvalidNode(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("runtime error on {node}: {source}")]
    Runtime {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("runtime call on {node} timed out after {}ms", .timeout.as_millis())]
    Timeout { node: String, timeout: std::time::Duration },
}

impl ClusterError {
    /// Whether the error means the referenced entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClusterError::NodeNotFound(_)
                | ClusterError::ContainerNotFound(_)
                | ClusterError::State(StateError::NotFound(_))
        )
    }
}
