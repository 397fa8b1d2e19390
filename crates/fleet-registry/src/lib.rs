//! fleet-registry — the cluster registry.
//!
//! Owns every node and unit record. Backed by [redb](https://docs.rs/redb),
//! with both persistent and in-memory backends.
//!
//! # Architecture
//!
//! ```text
//! Cluster (facade, Clone)
//!   ├── StateStore (redb, JSON values)
//!   │   ├── nodes            address → Node
//!   │   ├── containers       id → Container
//!   │   ├── autoscale_rules  pool → AutoScaleRule
//!   │   ├── events           {kind}/{value}/{start_nanos} → EventRecord
//!   │   └── log_config       pool → LogConfig
//!   ├── ContainerRuntime (run_on_node)
//!   └── ActionLimiter (per-node semaphore)
//! ```
//!
//! Nodes and units reference each other only by address and id, and every
//! traversal is a lookup. Check-then-write operations (registering a node,
//! attaching a unit to a node) run inside a single redb write transaction,
//! and redb serializes writers.

pub mod cluster;
pub mod error;
pub mod limiter;
pub mod store;
pub mod tables;
pub mod types;

pub use cluster::Cluster;
pub use error::{ClusterError, ClusterResult, StateError, StateResult};
pub use limiter::ActionLimiter;
pub use store::StateStore;
pub use types::*;
