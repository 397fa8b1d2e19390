//! fleet-scheduler — placement of units on nodes.
//!
//! Given an app, a process name and the nodes of the app's pool, the
//! scheduler picks the node that keeps the app spread across failure
//! domains (zones, networks, ...) and, inside a domain, across nodes.
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── Cluster (pool nodes, unit counts)
//!   ├── AppCatalog (plan memory for the memory filter)
//!   ├── host mutex (read counts → reserve placement, atomically)
//!   └── pending placements (in-flight units not yet in the registry)
//!
//! metadata helpers
//!   ├── split_metadata            exclusive groups + common metadata
//!   ├── choose_metadata_from_nodes metadata for the next new node
//!   ├── can_remove_node           failure-domain safety check
//!   └── choose_nodes_for_removal  scale-down victims
//! ```

pub mod error;
pub mod metadata;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use metadata::{
    MetadataGroup, SplitMetadata, can_remove_node, choose_metadata_from_nodes,
    choose_nodes_for_removal, split_metadata,
};
pub use scheduler::{Placement, ScheduleRequest, Scheduler, choose_node, order_for_removal};
