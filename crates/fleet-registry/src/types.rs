//! Domain types for the cluster registry.
//!
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use fleet_core::config::AutoScaleConfig;

/// Metadata key naming the pool a node belongs to.
pub const POOL_METADATA: &str = "pool";

/// Metadata key naming the IaaS that created a node.
pub const IAAS_METADATA: &str = "iaas";

// ── Node ───────────────────────────────────────────────────────────

/// Where a node is in its registration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreationStatus {
    Pending,
    Created,
    Disabled,
    Error,
}

/// A cluster member running a container engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier and connection endpoint.
    pub address: String,
    pub metadata: HashMap<String, String>,
    pub creation_status: CreationStatus,
    #[serde(default)]
    pub creation_error: Option<String>,
    /// Machine id, for nodes created through an IaaS driver.
    #[serde(default)]
    pub iaas_id: Option<String>,
}

impl Node {
    /// A created node in `pool` with no other metadata.
    pub fn new(address: &str, pool: &str) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(POOL_METADATA.to_string(), pool.to_string());
        Self {
            address: address.to_string(),
            metadata,
            creation_status: CreationStatus::Created,
            creation_error: None,
            iaas_id: None,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_status(mut self, status: CreationStatus) -> Self {
        self.creation_status = status;
        self
    }

    pub fn pool(&self) -> &str {
        self.metadata.get(POOL_METADATA).map(String::as_str).unwrap_or("")
    }

    pub fn iaas(&self) -> Option<&str> {
        self.metadata.get(IAAS_METADATA).map(String::as_str)
    }

    /// Host part of the address, without scheme or port.
    pub fn host(&self) -> &str {
        url_to_host(&self.address)
    }

    /// Whether every `filter` entry is present in this node's metadata.
    pub fn matches_metadata(&self, filter: &HashMap<String, String>) -> bool {
        filter
            .iter()
            .all(|(k, v)| self.metadata.get(k).is_some_and(|mine| mine == v))
    }
}

/// Strip an optional scheme and port from a node address.
pub fn url_to_host(address: &str) -> &str {
    let rest = address
        .strip_prefix("http://")
        .or_else(|| address.strip_prefix("https://"))
        .unwrap_or(address);
    let rest = rest.split('/').next().unwrap_or(rest);
    rest.rsplit_once(':').map(|(host, _)| host).unwrap_or(rest)
}

// ── Container ──────────────────────────────────────────────────────

/// Runtime status of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Building,
    Created,
    Starting,
    Started,
    Stopped,
    Asleep,
    Error,
}

impl ContainerStatus {
    /// Order in which units are picked for removal: least useful first.
    pub fn removal_priority(self) -> u8 {
        match self {
            ContainerStatus::Created => 0,
            ContainerStatus::Building => 1,
            ContainerStatus::Error => 2,
            ContainerStatus::Stopped => 3,
            ContainerStatus::Asleep => 4,
            ContainerStatus::Starting => 5,
            ContainerStatus::Started => 6,
        }
    }
}

/// One unit of one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub app_name: String,
    pub process_name: String,
    pub image_id: String,
    /// Address of the node hosting this unit.
    pub host_addr: String,
    pub host_port: String,
    pub ip: String,
    pub status: ContainerStatus,
    /// Unix timestamp (seconds) of the last status change.
    pub last_status_update: u64,
}

impl Container {
    /// Routable `host:port` of this unit.
    pub fn address(&self) -> String {
        format!("{}:{}", url_to_host(&self.host_addr), self.host_port)
    }

    pub fn set_status(&mut self, status: ContainerStatus) {
        self.status = status;
        self.last_status_update = epoch_secs();
    }
}

/// Selection criteria for listing units. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    pub apps: Vec<String>,
    pub process: Option<String>,
    pub hosts: Vec<String>,
    pub statuses: Vec<ContainerStatus>,
    pub exclude_ids: Vec<String>,
}

impl ContainerFilter {
    pub fn app(app: &str) -> Self {
        Self {
            apps: vec![app.to_string()],
            ..Self::default()
        }
    }

    pub fn host(host: &str) -> Self {
        Self {
            hosts: vec![host.to_string()],
            ..Self::default()
        }
    }

    pub fn with_process(mut self, process: &str) -> Self {
        self.process = Some(process.to_string());
        self
    }

    pub fn with_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<ContainerStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn matches(&self, c: &Container) -> bool {
        (self.apps.is_empty() || self.apps.contains(&c.app_name))
            && self.process.as_ref().is_none_or(|p| *p == c.process_name)
            && (self.hosts.is_empty() || self.hosts.contains(&c.host_addr))
            && (self.statuses.is_empty() || self.statuses.contains(&c.status))
            && !self.exclude_ids.contains(&c.id)
    }
}

// ── Auto-scale rule ────────────────────────────────────────────────

/// Stored auto-scale rule for one pool.
///
/// `metadata_filter` is the pool name; the empty string is the default rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoScaleRule {
    #[serde(default)]
    pub metadata_filter: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_container_count: u32,
    #[serde(default)]
    pub max_memory_ratio: f64,
    #[serde(default)]
    pub scale_down_ratio: f64,
    #[serde(default)]
    pub prevent_rebalance: bool,
}

impl AutoScaleRule {
    /// The rule the `[autoscale]` settings describe, under the default key.
    /// `None` when they set neither a container count nor a memory ratio.
    pub fn from_legacy(config: &AutoScaleConfig) -> Option<Self> {
        if !config.has_legacy_rule() {
            return None;
        }
        Some(Self {
            metadata_filter: String::new(),
            enabled: true,
            max_container_count: config.max_container_count,
            max_memory_ratio: config.max_memory_ratio,
            scale_down_ratio: config.scale_down_ratio,
            prevent_rebalance: config.prevent_rebalance,
        })
    }
}

// ── Events ─────────────────────────────────────────────────────────

/// What an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTarget {
    /// Target type, e.g. "pool".
    pub kind: String,
    pub value: String,
}

impl EventTarget {
    pub fn pool(name: &str) -> Self {
        Self {
            kind: "pool".to_string(),
            value: name.to_string(),
        }
    }
}

/// One entry of the append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub target: EventTarget,
    /// Event kind, e.g. "autoscale".
    pub kind: String,
    /// Unix timestamp (nanoseconds) when the event started.
    pub start_nanos: u64,
    /// Unix timestamp (nanoseconds) when the event finished.
    pub end_nanos: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default)]
    pub custom_data: serde_json::Value,
}

impl EventRecord {
    pub fn table_key(&self) -> String {
        format!(
            "{}/{}/{:020}",
            self.target.kind, self.target.value, self.start_nanos
        )
    }
}

// ── Log config ─────────────────────────────────────────────────────

/// Container log driver settings for one pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Pool name; empty for the default entry.
    #[serde(default)]
    pub pool: String,
    pub driver: String,
    #[serde(default)]
    pub opts: HashMap<String, String>,
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Nanoseconds since the Unix epoch.
pub fn epoch_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_to_host_strips_scheme_and_port() {
        assert_eq!(url_to_host("http://10.0.0.1:2375"), "10.0.0.1");
        assert_eq!(url_to_host("10.0.0.1:2375"), "10.0.0.1");
        assert_eq!(url_to_host("node-a"), "node-a");
        assert_eq!(url_to_host("https://node-a:2376/"), "node-a");
    }

    #[test]
    fn removal_priority_puts_started_last() {
        let mut statuses = vec![
            ContainerStatus::Started,
            ContainerStatus::Stopped,
            ContainerStatus::Created,
            ContainerStatus::Starting,
            ContainerStatus::Error,
            ContainerStatus::Building,
        ];
        statuses.sort_by_key(|s| s.removal_priority());
        assert_eq!(
            statuses,
            vec![
                ContainerStatus::Created,
                ContainerStatus::Building,
                ContainerStatus::Error,
                ContainerStatus::Stopped,
                ContainerStatus::Starting,
                ContainerStatus::Started,
            ]
        );
    }

    #[test]
    fn node_metadata_filter() {
        let node = Node::new("n1:2375", "p1").with_metadata("zone", "a");
        let mut filter = HashMap::new();
        filter.insert("zone".to_string(), "a".to_string());
        assert!(node.matches_metadata(&filter));
        filter.insert("pool".to_string(), "p2".to_string());
        assert!(!node.matches_metadata(&filter));
    }

    #[test]
    fn rule_uses_camel_case_on_the_wire() {
        let rule = AutoScaleRule {
            metadata_filter: "p1".to_string(),
            enabled: true,
            max_container_count: 10,
            max_memory_ratio: 0.0,
            scale_down_ratio: 1.5,
            prevent_rebalance: false,
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["metadataFilter"], "p1");
        assert_eq!(json["maxContainerCount"], 10);
    }
}
