use std::sync::Arc;

use fleet_autoscale::Autoscaler;
use fleet_core::config::{AutoScaleConfig, PipelineConfig, SchedulerConfig};
use fleet_core::memory::{MemoryCatalog, MemoryIaas, MemoryRouter, MemoryRuntime};
use fleet_pipeline::Provisioner;
use fleet_registry::{Cluster, StateStore};

use crate::ApiState;

pub(crate) fn test_state() -> ApiState {
    let runtime = Arc::new(MemoryRuntime::new());
    let cluster = Cluster::new(StateStore::open_in_memory().unwrap(), runtime);
    let provisioner = Provisioner::new(
        cluster,
        Arc::new(MemoryCatalog::new()),
        Arc::new(MemoryRouter::new()),
        SchedulerConfig::default(),
        PipelineConfig {
            lock_wait_timeout: "200ms".to_string(),
            ..PipelineConfig::default()
        },
    );
    let autoscaler = Autoscaler::new(provisioner, Arc::new(MemoryIaas::new()), AutoScaleConfig::default());
    ApiState::new(autoscaler)
}
