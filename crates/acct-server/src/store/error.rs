//! Error types for store gateway operations

use thiserror::Error;

/// Errors surfaced by the store gateway
///
/// `NotFound` is an expected outcome that callers map to domain results.
/// Every transport fault collapses into `Unavailable` so that callers can
/// log one event id without inspecting the cause.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Key is absent (or expired)
    #[error("key not found")]
    NotFound,

    /// Connection refused or dropped, timeout, protocol error
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Shutdown deadline reached while the command was in flight
    #[error("store command cancelled by shutdown")]
    Cancelled,

    /// A stored field could not be decoded
    #[error("malformed stored field {field}: {value:?}")]
    Malformed { field: &'static str, value: String },

    /// Bad connection parameters
    #[error("store configuration error: {0}")]
    Config(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Unavailable(format!("connection error: {}", err))
        } else if err.is_timeout() {
            StoreError::Unavailable(format!("timeout: {}", err))
        } else {
            StoreError::Unavailable(format!("redis error: {}", err))
        }
    }
}
