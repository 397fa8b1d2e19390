//! Auto-scale error types.

use thiserror::Error;

use fleet_pipeline::PipelineError;
use fleet_registry::{ClusterError, StateError};
use fleet_scheduler::SchedulerError;

#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("couldn't find max plan: no plans and no default plan")]
    MissingPlan,

    #[error("no value found for memory metadata {key:?} in node {node}")]
    MissingTotalMemory { node: String, key: String },

    #[error("no IaaS information in nodes metadata: {0}")]
    NoIaasMetadata(String),

    #[error(
        "aborting, impossible to fit max plan memory of {plan} bytes, node max available memory is {max}"
    )]
    ImpossibleToFit { plan: u64, max: u64 },

    #[error("error adding new node {address}: {reason}")]
    NodeNotReady { address: String, reason: String },

    #[error("unable to lock app {0}, retry later")]
    AppNotLocked(String),

    #[error("unable to create machine: {0}")]
    Iaas(#[source] anyhow::Error),

    #[error("catalog error: {0}")]
    Catalog(#[source] anyhow::Error),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl AutoscaleError {
    /// Errors caused by bad input rather than cluster state.
    pub fn is_invalid(&self) -> bool {
        matches!(self, AutoscaleError::InvalidRule(_))
    }
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;
