//! Error types shared across the shard-cron crates.

use thiserror::Error;

/// Errors raised while validating, encoding or configuring jobs.
#[derive(Debug, Error)]
pub enum CronError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted record could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Persisted record decoded but is missing required fields
    #[error("Corrupt job record: {0}")]
    CorruptRecord(String),

    /// Job definition rejected before it reached storage
    #[error("Invalid job: {0}")]
    InvalidJob(String),
}
