//! Registry error types.

use thiserror::Error;

use cron_coordination::CoordinationError;
use cron_types::CronError;

/// Error returned by a [`crate::JobListener`] callback.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the job registry
#[derive(Error, Debug)]
pub enum StoreError {
    /// Record could not be encoded or decoded
    #[error("Record error: {0}")]
    Record(#[from] CronError),

    /// Coordination service failure
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// Listener rejected a job
    #[error("Listener rejected job '{name}': {source}")]
    Listener {
        name: String,
        #[source]
        source: ListenerError,
    },

    /// `start` was called twice
    #[error("Job store already started")]
    AlreadyStarted,
}
