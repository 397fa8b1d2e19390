//! Interfaces to the systems the orchestrator drives but does not own.
//!
//! ```text
//! ContainerRuntime  create/start/stop/remove units on a node, ping nodes
//! Router            app -> set of backend addresses
//! IaasDriver        create/destroy machines that become nodes
//! AppCatalog        read-only app projection and memory plans
//! ```

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Everything the runtime needs to create one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub app: String,
    pub process: String,
    pub image: String,
    pub memory: u64,
    pub env: HashMap<String, String>,
    pub log_driver: Option<String>,
    pub log_opts: HashMap<String, String>,
}

/// What the runtime reports back after creating a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeContainer {
    pub id: String,
    pub ip: String,
    pub host_port: String,
}

/// A machine handed out by an IaaS driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub iaas: String,
    /// Address the new node will be registered under.
    pub address: String,
}

/// A memory plan. Every unit of an app reserves `memory` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub memory: u64,
}

/// Health check declared by an app's current image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Expected status code. 0 accepts any 2xx.
    #[serde(default)]
    pub status: u16,
    /// Regex the response body must match.
    #[serde(default)]
    pub body_match: Option<String>,
    /// Failed probes tolerated before the check gives up early.
    #[serde(default)]
    pub allowed_failures: u32,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Read-only projection of an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub pool: String,
    pub plan: Plan,
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub healthcheck: Option<HealthcheckConfig>,
}

/// Container engine reachable at each node address.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create_container(&self, node: &str, spec: &ContainerSpec) -> Result<RuntimeContainer>;

    async fn start_container(&self, node: &str, id: &str) -> Result<()>;

    async fn stop_container(&self, node: &str, id: &str) -> Result<()>;

    async fn remove_container(&self, node: &str, id: &str) -> Result<()>;

    /// Succeeds once the engine on `node` answers.
    async fn ping(&self, node: &str) -> Result<()>;
}

/// Maps an app name to the backend addresses serving it.
#[async_trait]
pub trait Router: Send + Sync {
    async fn add_routes(&self, app: &str, addresses: &[String]) -> Result<()>;

    async fn remove_routes(&self, app: &str, addresses: &[String]) -> Result<()>;

    async fn routes(&self, app: &str) -> Result<Vec<String>>;
}

/// Creates and destroys machines. Idempotent by machine id.
#[async_trait]
pub trait IaasDriver: Send + Sync {
    async fn create_machine(&self, iaas: &str, metadata: &HashMap<String, String>) -> Result<Machine>;

    async fn delete_machine(&self, id: &str) -> Result<()>;
}

/// Source of app projections and plans.
#[async_trait]
pub trait AppCatalog: Send + Sync {
    async fn app(&self, name: &str) -> Result<AppInfo>;

    async fn plans(&self) -> Result<Vec<Plan>>;

    async fn default_plan(&self) -> Result<Option<Plan>>;
}
