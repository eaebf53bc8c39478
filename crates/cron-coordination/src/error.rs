//! Coordination layer error types.

use thiserror::Error;

/// Errors raised by the coordination primitives.
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// Partitioning parameters rejected
    #[error("Invalid partitioning: {0}")]
    InvalidPartitioning(String),

    /// Stored value could not be interpreted
    #[error("Corrupt value at {key}: {reason}")]
    CorruptValue { key: String, reason: String },

    /// Watch stream closed because the store went away
    #[error("Watch closed")]
    WatchClosed,
}
