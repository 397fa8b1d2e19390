//! fleet-health — health checks for freshly started units.
//!
//! After a unit starts, the pipeline waits for it to answer its app's
//! declared health check before routing traffic to it.
//!
//! # Architecture
//!
//! ```text
//! wait_healthy(address, HealthcheckConfig, timeout)
//!   ├── compile body regex, parse method   (bad config fails fast)
//!   └── loop until timeout
//!       ├── probe() → ProbeResult
//!       ├── HealthTracker (failure budget, backoff)
//!       └── sleep(next_interval)
//! ```
//!
//! Connection failures mean the unit is still booting and are retried
//! until the timeout. Wrong answers (status or body) count against the
//! check's `allowed_failures` budget.

pub mod checker;
pub mod error;

pub use checker::{HealthTracker, ProbeResult, probe, wait_healthy};
pub use error::{HealthError, HealthResult};
