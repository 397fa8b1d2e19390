//! fleet-core — shared pieces for the Fleet orchestration crates.
//!
//! - [`config`] — `fleet.toml` parsing with defaults for every section
//! - [`progress`] — newline-delimited JSON progress messages
//! - [`provider`] — interfaces to the container runtime, router, IaaS
//!   driver and application catalog
//! - [`memory`] — in-memory implementations of those interfaces

pub mod config;
pub mod memory;
pub mod progress;
pub mod provider;

pub use config::{FleetConfig, parse_duration};
pub use progress::{Progress, ProgressEvent};
pub use provider::*;
