//! fleet.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub daemon: DaemonConfig,
    pub scheduler: SchedulerConfig,
    pub pipeline: PipelineConfig,
    pub autoscale: AutoScaleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: PathBuf::from("/var/lib/fleet"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fraction of a node's `totalMem` that plans may reserve. 0 disables the filter.
    pub max_memory_ratio: f64,
    /// Node metadata key holding the node's total memory in bytes.
    pub total_memory_metadata: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_memory_ratio: 0.0,
            total_memory_metadata: "totalMem".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Parallel unit operations per batch. 0 means unbounded.
    pub max_workers: usize,
    /// Concurrent runtime operations per node. 0 means unbounded.
    pub node_action_limit: usize,
    pub healthcheck_timeout: String,
    pub lock_wait_timeout: String,
    pub route_rebuild_interval: String,
    /// Upper bound on one container-runtime call.
    pub runtime_timeout: String,
    /// Upper bound on one router call.
    pub router_timeout: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            node_action_limit: 0,
            healthcheck_timeout: "120s".to_string(),
            lock_wait_timeout: "30s".to_string(),
            route_rebuild_interval: "5s".to_string(),
            runtime_timeout: "2m".to_string(),
            router_timeout: "30s".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn healthcheck_timeout(&self) -> Duration {
        parse_duration(&self.healthcheck_timeout).unwrap_or(Duration::from_secs(120))
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        parse_duration(&self.lock_wait_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn route_rebuild_interval(&self) -> Duration {
        parse_duration(&self.route_rebuild_interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn runtime_timeout(&self) -> Duration {
        parse_duration(&self.runtime_timeout).unwrap_or(Duration::from_secs(120))
    }

    pub fn router_timeout(&self) -> Duration {
        parse_duration(&self.router_timeout).unwrap_or(Duration::from_secs(30))
    }
}

/// Auto-scale loop settings.
///
/// The `max_container_count`, `max_memory_ratio`, `scale_down_ratio` and
/// `prevent_rebalance` fields describe the legacy rule. It is only consulted
/// when neither the pool nor the default key has a stored rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScaleConfig {
    pub enabled: bool,
    pub interval: String,
    pub wait_new_machine: String,
    /// Upper bound on one IaaS create or delete call.
    pub machine_timeout: String,
    pub total_memory_metadata: String,
    pub max_container_count: u32,
    pub max_memory_ratio: f64,
    pub scale_down_ratio: f64,
    pub prevent_rebalance: bool,
}

impl Default for AutoScaleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: "1h".to_string(),
            wait_new_machine: "5m".to_string(),
            machine_timeout: "10m".to_string(),
            total_memory_metadata: "totalMem".to_string(),
            max_container_count: 0,
            max_memory_ratio: 0.0,
            scale_down_ratio: 1.333,
            prevent_rebalance: false,
        }
    }
}

impl AutoScaleConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(3600))
    }

    pub fn wait_new_machine(&self) -> Duration {
        parse_duration(&self.wait_new_machine).unwrap_or(Duration::from_secs(300))
    }

    pub fn machine_timeout(&self) -> Duration {
        parse_duration(&self.machine_timeout).unwrap_or(Duration::from_secs(600))
    }

    /// Whether the legacy settings describe a usable rule at all.
    pub fn has_legacy_rule(&self) -> bool {
        self.max_container_count > 0 || self.max_memory_ratio > 0.0
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Parse a duration string like "500ms", "5s", "2m", "1h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
