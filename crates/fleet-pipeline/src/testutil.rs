//! Shared fixture for pipeline tests: in-memory registry, runtime, router
//! and catalog wired into one provisioner with short timeouts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use fleet_core::config::{PipelineConfig, SchedulerConfig};
use fleet_core::memory::{MemoryCatalog, MemoryRouter, MemoryRuntime};
use fleet_core::{AppInfo, Plan, Progress};
use fleet_registry::{Cluster, Container, ContainerStatus, Node, StateStore};

use crate::provisioner::Provisioner;

pub(crate) struct Fixture {
    pub runtime: Arc<MemoryRuntime>,
    pub router: Arc<MemoryRouter>,
    pub catalog: Arc<MemoryCatalog>,
    pub cluster: Cluster,
    pub provisioner: Provisioner,
    ports: AtomicU16,
}

pub(crate) fn test_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        max_workers: 4,
        node_action_limit: 0,
        healthcheck_timeout: "300ms".to_string(),
        lock_wait_timeout: "200ms".to_string(),
        route_rebuild_interval: "20ms".to_string(),
        runtime_timeout: "2s".to_string(),
        router_timeout: "200ms".to_string(),
    }
}

impl Fixture {
    pub async fn new() -> Self {
        let runtime = Arc::new(MemoryRuntime::new());
        let router = Arc::new(MemoryRouter::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let cluster = Cluster::new(StateStore::open_in_memory().unwrap(), runtime.clone());
        let provisioner = Provisioner::new(
            cluster.clone(),
            catalog.clone(),
            router.clone(),
            SchedulerConfig::default(),
            test_pipeline_config(),
        );
        Self {
            runtime,
            router,
            catalog,
            cluster,
            provisioner,
            ports: AtomicU16::new(40000),
        }
    }

    pub fn add_node(&self, address: &str, pool: &str) -> Node {
        let node = Node::new(address, pool);
        self.cluster.register(&node).unwrap();
        node
    }

    /// Record a unit in the registry only. Nothing runs in the runtime.
    pub fn add_unit(
        &self,
        id: &str,
        app: &str,
        process: &str,
        host: &str,
        status: ContainerStatus,
    ) -> Container {
        let port = self.ports.fetch_add(1, Ordering::Relaxed);
        let unit = Container {
            id: id.to_string(),
            name: format!("{app}-{process}-{id}"),
            app_name: app.to_string(),
            process_name: process.to_string(),
            image_id: format!("registry/{app}:v1"),
            host_addr: host.to_string(),
            host_port: port.to_string(),
            ip: "172.17.0.2".to_string(),
            status,
            last_status_update: 0,
        };
        self.cluster.add_container(&unit).unwrap();
        unit
    }

    pub async fn add_app(&self, name: &str, pool: &str) -> AppInfo {
        let app = AppInfo {
            name: name.to_string(),
            pool: pool.to_string(),
            plan: Plan {
                name: "small".to_string(),
                memory: 128 << 20,
            },
            image: format!("registry/{name}:v1"),
            env: HashMap::new(),
            healthcheck: None,
        };
        self.catalog.insert_app(app.clone()).await;
        app
    }

    /// Start `n` real units through the pipeline.
    pub async fn start_units(
        &self,
        app: &str,
        process: &str,
        n: usize,
        to_host: Option<&str>,
    ) -> Vec<Container> {
        let counts: BTreeMap<String, usize> = [(process.to_string(), n)].into_iter().collect();
        let owner = self.provisioner.locker().new_owner("fixture");
        self.provisioner
            .add_units(&owner, app, &counts, to_host, &Progress::discard())
            .await
            .unwrap()
    }
}
