//! Health check error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("healthcheck for {address} timed out after {elapsed_ms}ms: {last}")]
    Timeout {
        address: String,
        elapsed_ms: u128,
        last: String,
    },

    #[error("healthcheck for {address} failed: unexpected status {got}, want {want}")]
    UnexpectedStatus { address: String, got: u16, want: String },

    #[error("healthcheck for {address} failed: body does not match {pattern:?}")]
    BodyMismatch { address: String, pattern: String },

    #[error("invalid healthcheck config: {0}")]
    BadConfig(String),
}

pub type HealthResult<T> = Result<T, HealthError>;
