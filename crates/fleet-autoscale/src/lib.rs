//! fleet-autoscale — node auto-scaling per pool.
//!
//! Each tick resolves every pool's rule, asks a scaler how many nodes the
//! pool is missing or has in excess, creates or drains nodes accordingly,
//! rebalances units and records what it did in the event log.
//!
//! # Tick
//!
//! ```text
//! for pool (parallel, one tick per pool at a time):
//!   rule     = Cluster::autoscale_rule: stored[pool] | stored[""] | legacy config
//!   locks    = try_lock(every app with units in the pool)
//!   result   = Count (maxContainerCount > 0) | Memory
//!                 → {toadd, toremove, torebalance, reason}
//!   toadd    → IaaS create_machine → register pending → ping → created
//!   toremove → disable → move units away → deregister → delete_machine
//!   rebalance_pool(force = nodes were added)   unless preventRebalance
//!   event    = EventRecord{pool, "autoscale", custom data}   unless no-op
//! ```

pub mod autoscaler;
pub mod error;
pub mod rule;
pub mod scaler;

pub use autoscaler::{Autoscaler, EVENT_KIND};
pub use error::{AutoscaleError, AutoscaleResult};
pub use rule::{DEFAULT_SCALE_DOWN_RATIO, normalize_rule, set_rule};
pub use scaler::{PoolState, Scaler, ScalerResult};
