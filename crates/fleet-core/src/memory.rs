//! In-memory collaborators.
//!
//! Used by the test suites and by `fleetd --provider memory`. Each one
//! keeps its state behind a tokio mutex and exposes a few switches for
//! injecting failures.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::provider::*;

/// A unit as the in-memory runtime sees it.
#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub node: String,
    pub spec: ContainerSpec,
    pub running: bool,
}

/// Container runtime that only keeps bookkeeping.
pub struct MemoryRuntime {
    counter: AtomicU64,
    containers: Mutex<HashMap<String, MemoryContainer>>,
    unreachable: Mutex<HashSet<String>>,
    fail_creates: AtomicUsize,
    fail_starts: AtomicBool,
    hang_pings: AtomicBool,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            containers: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
            fail_creates: AtomicUsize::new(0),
            fail_starts: AtomicBool::new(false),
            hang_pings: AtomicBool::new(false),
        }
    }

    /// Make `ping` never answer, on every node.
    pub fn set_hang_pings(&self, hang: bool) {
        self.hang_pings.store(hang, Ordering::SeqCst);
    }

    /// Make `ping` (and every other call) fail for `node`.
    pub async fn set_unreachable(&self, node: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().await;
        if unreachable {
            set.insert(node.to_string());
        } else {
            set.remove(node);
        }
    }

    /// Fail the next `n` container creations.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub async fn container(&self, id: &str) -> Option<MemoryContainer> {
        self.containers.lock().await.get(id).cloned()
    }

    pub async fn container_count(&self) -> usize {
        self.containers.lock().await.len()
    }

    async fn check_reachable(&self, node: &str) -> Result<()> {
        if self.unreachable.lock().await.contains(node) {
            bail!("cannot connect to container engine at {node}");
        }
        Ok(())
    }
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn create_container(&self, node: &str, spec: &ContainerSpec) -> Result<RuntimeContainer> {
        self.check_reachable(node).await?;
        let pending_failures = self.fail_creates.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_creates.store(pending_failures - 1, Ordering::SeqCst);
            bail!("create refused on {node}");
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{n:012x}");
        self.containers.lock().await.insert(
            id.clone(),
            MemoryContainer {
                node: node.to_string(),
                spec: spec.clone(),
                running: false,
            },
        );
        debug!(%node, %id, app = %spec.app, "memory runtime created container");
        Ok(RuntimeContainer {
            id,
            ip: format!("172.17.{}.{}", (n >> 8) & 0xff, n & 0xff),
            host_port: (30000 + n).to_string(),
        })
    }

    async fn start_container(&self, node: &str, id: &str) -> Result<()> {
        self.check_reachable(node).await?;
        if self.fail_starts.load(Ordering::SeqCst) {
            bail!("start refused for {id}");
        }
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| anyhow!("no such container: {id}"))?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, node: &str, id: &str) -> Result<()> {
        self.check_reachable(node).await?;
        if let Some(container) = self.containers.lock().await.get_mut(id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, node: &str, id: &str) -> Result<()> {
        self.check_reachable(node).await?;
        self.containers.lock().await.remove(id);
        Ok(())
    }

    async fn ping(&self, node: &str) -> Result<()> {
        if self.hang_pings.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.check_reachable(node).await
    }
}

/// Router holding routes in a map.
#[derive(Default)]
pub struct MemoryRouter {
    routes: Mutex<HashMap<String, BTreeSet<String>>>,
    fail_adds: AtomicBool,
    fail_removes: AtomicBool,
    hang: AtomicBool,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make route changes never complete.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    async fn maybe_hang(&self) {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    pub fn set_fail_adds(&self, fail: bool) {
        self.fail_adds.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Router for MemoryRouter {
    async fn add_routes(&self, app: &str, addresses: &[String]) -> Result<()> {
        self.maybe_hang().await;
        if self.fail_adds.load(Ordering::SeqCst) {
            bail!("router unavailable adding routes for {app}");
        }
        let mut routes = self.routes.lock().await;
        routes
            .entry(app.to_string())
            .or_default()
            .extend(addresses.iter().cloned());
        Ok(())
    }

    async fn remove_routes(&self, app: &str, addresses: &[String]) -> Result<()> {
        self.maybe_hang().await;
        if self.fail_removes.load(Ordering::SeqCst) {
            bail!("router unavailable removing routes for {app}");
        }
        let mut routes = self.routes.lock().await;
        if let Some(set) = routes.get_mut(app) {
            for addr in addresses {
                set.remove(addr);
            }
        }
        Ok(())
    }

    async fn routes(&self, app: &str) -> Result<Vec<String>> {
        let routes = self.routes.lock().await;
        Ok(routes
            .get(app)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// IaaS driver that hands out sequential addresses.
#[derive(Default)]
pub struct MemoryIaas {
    counter: AtomicU64,
    machines: Mutex<HashMap<String, Machine>>,
    fail_creates: AtomicUsize,
    hang_creates: AtomicBool,
}

impl MemoryIaas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make machine creation never complete.
    pub fn set_hang_creates(&self, hang: bool) {
        self.hang_creates.store(hang, Ordering::SeqCst);
    }

    /// Fail the next `n` machine creations.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub async fn machines(&self) -> Vec<Machine> {
        self.machines.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl IaasDriver for MemoryIaas {
    async fn create_machine(&self, iaas: &str, metadata: &HashMap<String, String>) -> Result<Machine> {
        if self.hang_creates.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let pending_failures = self.fail_creates.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_creates.store(pending_failures - 1, Ordering::SeqCst);
            bail!("{iaas}: quota exceeded");
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let machine = Machine {
            id: format!("{iaas}-m{n}"),
            iaas: iaas.to_string(),
            address: format!("10.200.{}.{}:2375", (n >> 8) & 0xff, n & 0xff),
        };
        debug!(id = %machine.id, address = %machine.address, ?metadata, "memory iaas created machine");
        self.machines
            .lock()
            .await
            .insert(machine.id.clone(), machine.clone());
        Ok(machine)
    }

    async fn delete_machine(&self, id: &str) -> Result<()> {
        self.machines.lock().await.remove(id);
        Ok(())
    }
}

/// App catalog seeded by hand.
#[derive(Default)]
pub struct MemoryCatalog {
    apps: Mutex<HashMap<String, AppInfo>>,
    plans: Mutex<Vec<Plan>>,
    default_plan: Mutex<Option<Plan>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an app. Its plan is also added to the plan list.
    pub async fn insert_app(&self, app: AppInfo) {
        {
            let mut plans = self.plans.lock().await;
            if !plans.iter().any(|p| p.name == app.plan.name) {
                plans.push(app.plan.clone());
            }
        }
        self.apps.lock().await.insert(app.name.clone(), app);
    }

    pub async fn set_plans(&self, plans: Vec<Plan>) {
        *self.plans.lock().await = plans;
    }

    pub async fn set_default_plan(&self, plan: Option<Plan>) {
        *self.default_plan.lock().await = plan;
    }
}

#[async_trait]
impl AppCatalog for MemoryCatalog {
    async fn app(&self, name: &str) -> Result<AppInfo> {
        self.apps
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("app not found: {name}"))
    }

    async fn plans(&self) -> Result<Vec<Plan>> {
        Ok(self.plans.lock().await.clone())
    }

    async fn default_plan(&self) -> Result<Option<Plan>> {
        Ok(self.default_plan.lock().await.clone())
    }
}
