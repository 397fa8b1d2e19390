//! Pipeline error types.

use thiserror::Error;

use fleet_health::HealthError;
use fleet_registry::{ClusterError, StateError};
use fleet_scheduler::SchedulerError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No actions to execute.")]
    NoActions,

    #[error("action {action} failed: {reason}")]
    ActionFailed { action: String, reason: String },

    #[error("unable to lock app {0}: locked by another operation")]
    AppLocked(String),

    /// One entry per failed unit: `(unit, error)`.
    #[error("{} unit(s) failed: {}", .0.len(), format_failures(.0))]
    Composite(Vec<(String, String)>),

    #[error("not enough units of {app}/{process} to remove: want {want}, have {have}")]
    NotEnoughUnits {
        app: String,
        process: String,
        want: usize,
        have: usize,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("router error: {0}")]
    Router(#[source] anyhow::Error),

    #[error("catalog error: {0}")]
    Catalog(#[source] anyhow::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Health(#[from] HealthError),
}

impl PipelineError {
    pub fn is_not_found(&self) -> bool {
        match self {
            PipelineError::Cluster(e) => e.is_not_found(),
            PipelineError::Scheduler(SchedulerError::Cluster(e)) => e.is_not_found(),
            _ => false,
        }
    }

    /// Errors caused by the request itself rather than the cluster.
    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidRequest(_)
                | PipelineError::NotEnoughUnits { .. }
                | PipelineError::Scheduler(SchedulerError::NoAvailableNode(_))
        )
    }
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(unit, err)| format!("{unit}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type PipelineResult<T> = Result<T, PipelineError>;
