//! redb table definitions for the cluster registry.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Nodes keyed by address.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Units keyed by container id.
pub const CONTAINERS: TableDefinition<&str, &[u8]> = TableDefinition::new("containers");

/// Auto-scale rules keyed by pool. The empty key holds the default rule.
pub const AUTOSCALE_RULES: TableDefinition<&str, &[u8]> = TableDefinition::new("autoscale_rules");

/// Append-only event log keyed by `{target_kind}/{target_value}/{start_nanos:020}`.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Container log settings keyed by pool. The empty key holds the default.
pub const LOG_CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("log_config");
