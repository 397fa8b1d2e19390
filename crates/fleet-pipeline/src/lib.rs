//! fleet-pipeline — reversible unit operations.
//!
//! Every change to an app's units goes through one pipeline of actions
//! that can be undone. A failing action triggers the `backward` step of
//! every action that already ran, newest first.
//!
//! # Architecture
//!
//! ```text
//! Provisioner (Clone)
//!   ├── replace_units ── Pipeline<UnitBatch>
//!   │     AddNewUnits → AddNewRoutes → RemoveOldRoutes → RemoveOldUnits
//!   ├── add_units / remove_units            (per app, under the app lock)
//!   ├── move_container / move_containers    (one-for-one replace batches)
//!   ├── rebalance_containers / rebalance_pool
//!   ├── add_node / remove_node              (operator node registration)
//!   ├── AppLocker ── release ──▶ RouteRebuildQueue ──▶ run_route_rebuilds
//!   └── Scheduler / Cluster / Router / AppCatalog
//! ```

pub mod action;
pub mod error;
pub mod locker;
pub mod movement;
pub mod nodes;
pub mod provisioner;
pub mod routes;
pub mod units;

#[cfg(test)]
pub(crate) mod testutil;

pub use action::{Action, Pipeline};
pub use error::{PipelineError, PipelineResult};
pub use locker::{AppLockGuard, AppLocker, LockInfo};
pub use movement::{PlannedMove, RebalanceFilter, plan_rebalance};
pub use nodes::NodeRequest;
pub use provisioner::Provisioner;
pub use routes::{RebuildResult, RouteRebuildQueue, diff_routes};
pub use units::UnitBatch;
