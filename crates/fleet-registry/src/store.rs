//! StateStore — redb-backed persistence for the cluster registry.
//!
//! Provides typed CRUD operations over nodes, units, auto-scale rules,
//! events, and log settings. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [NODES, CONTAINERS, AUTOSCALE_RULES, EVENTS, LOG_CONFIG] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            }
        }
        Ok(results)
    }

    fn delete_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Write `value` under `key` only if `key` already exists.
    fn replace_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            if t.get(key).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(key.to_string()));
            }
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert a node. Fails if the address is already registered.
    pub fn insert_node(&self, node: &Node) -> StateResult<()> {
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            if table.get(node.address.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(node.address.clone()));
            }
            table
                .insert(node.address.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(address = %node.address, "node stored");
        Ok(())
    }

    /// Replace an existing node's record.
    pub fn update_node(&self, node: &Node) -> StateResult<()> {
        self.replace_json(NODES, &node.address, node)
    }

    pub fn get_node(&self, address: &str) -> StateResult<Option<Node>> {
        self.get_json(NODES, address)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.list_json(NODES, "")
    }

    /// Delete a node by address. Returns true if it existed.
    pub fn delete_node(&self, address: &str) -> StateResult<bool> {
        let existed = self.delete_key(NODES, address)?;
        debug!(%address, existed, "node deleted");
        Ok(existed)
    }

    // ── Containers ─────────────────────────────────────────────────

    /// Insert a unit. Fails unless its host node is registered, checked in
    /// the same write transaction.
    pub fn insert_container(&self, container: &Container) -> StateResult<()> {
        let value = serde_json::to_vec(container).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            if nodes
                .get(container.host_addr.as_str())
                .map_err(map_err!(Read))?
                .is_none()
            {
                return Err(StateError::NotFound(format!("node {}", container.host_addr)));
            }
            let mut table = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            if table.get(container.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(container.id.clone()));
            }
            table
                .insert(container.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %container.id, host = %container.host_addr, "container stored");
        Ok(())
    }

    /// Replace an existing unit's record.
    pub fn update_container(&self, container: &Container) -> StateResult<()> {
        self.replace_json(CONTAINERS, &container.id, container)
    }

    pub fn get_container(&self, id: &str) -> StateResult<Option<Container>> {
        self.get_json(CONTAINERS, id)
    }

    /// List units matching `filter`.
    pub fn list_containers(&self, filter: &ContainerFilter) -> StateResult<Vec<Container>> {
        let all: Vec<Container> = self.list_json(CONTAINERS, "")?;
        Ok(all.into_iter().filter(|c| filter.matches(c)).collect())
    }

    pub fn delete_container(&self, id: &str) -> StateResult<bool> {
        self.delete_key(CONTAINERS, id)
    }

    // ── Auto-scale rules ───────────────────────────────────────────

    pub fn put_rule(&self, rule: &AutoScaleRule) -> StateResult<()> {
        self.put_json(AUTOSCALE_RULES, &rule.metadata_filter, rule)?;
        debug!(pool = %rule.metadata_filter, "autoscale rule stored");
        Ok(())
    }

    pub fn get_rule(&self, pool: &str) -> StateResult<Option<AutoScaleRule>> {
        self.get_json(AUTOSCALE_RULES, pool)
    }

    pub fn list_rules(&self) -> StateResult<Vec<AutoScaleRule>> {
        self.list_json(AUTOSCALE_RULES, "")
    }

    pub fn delete_rule(&self, pool: &str) -> StateResult<bool> {
        self.delete_key(AUTOSCALE_RULES, pool)
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Append an event. Events are never rewritten.
    pub fn append_event(&self, event: &EventRecord) -> StateResult<()> {
        let key = event.table_key();
        let value = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List events of one kind, newest first, up to `limit`.
    pub fn list_events(&self, kind: &str, limit: usize) -> StateResult<Vec<EventRecord>> {
        let mut events: Vec<EventRecord> = self.list_json(EVENTS, "")?;
        events.retain(|e| e.kind == kind);
        events.sort_by(|a, b| b.start_nanos.cmp(&a.start_nanos));
        events.truncate(limit);
        Ok(events)
    }

    /// List events for one target, newest first.
    pub fn list_events_for_target(&self, target: &EventTarget) -> StateResult<Vec<EventRecord>> {
        let prefix = format!("{}/{}/", target.kind, target.value);
        let mut events: Vec<EventRecord> = self.list_json(EVENTS, &prefix)?;
        events.reverse();
        Ok(events)
    }

    // ── Log config ─────────────────────────────────────────────────

    pub fn put_log_config(&self, config: &LogConfig) -> StateResult<()> {
        self.put_json(LOG_CONFIG, &config.pool, config)
    }

    pub fn get_log_config(&self, pool: &str) -> StateResult<Option<LogConfig>> {
        self.get_json(LOG_CONFIG, pool)
    }

    pub fn list_log_configs(&self) -> StateResult<Vec<LogConfig>> {
        self.list_json(LOG_CONFIG, "")
    }
}
