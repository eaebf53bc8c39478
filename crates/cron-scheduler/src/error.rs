//! Error types for the scheduling engine.
//!
//! Errors fall into two groups. Configuration errors are returned to the
//! caller of `add_job` and the job is not scheduled. Everything that goes
//! wrong while firing an occurrence is handed to one of two pluggable
//! handlers and never stops the loop.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, warn};

use cron_coordination::CoordinationError;
use cron_rhythm::RhythmError;
use cron_store::StoreError;
use cron_types::{CronError, Job};

/// Errors that can occur during scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Rhythm expression could not be parsed
    #[error("Invalid rhythm: {0}")]
    Rhythm(#[from] RhythmError),

    /// Job definition rejected
    #[error("Invalid job: {0}")]
    Job(#[from] CronError),

    /// Rhythm-embedded repeat count disagrees with the job's
    #[error("Conflicting number of repeats: rhythm has {rhythm}, job has {job}")]
    ConflictingRepeats { rhythm: u32, job: u32 },

    /// Job hashes into a partition this host does not own
    #[error("Host does not own partition {0}")]
    PartitionNotOwned(u32),

    /// Job registry failure
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Lock session or lease failure
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// Occurrence lock failed for a reason other than its deadline
    #[error("Failed to lock {key}: {source}")]
    Lock {
        key: String,
        #[source]
        source: CoordinationError,
    },

    /// Trigger callback returned an error
    #[error("Trigger failed: {0}")]
    Trigger(#[source] anyhow::Error),

    /// Trigger callback reported failure
    #[error("Trigger reported failure for job {0}")]
    TriggerFailure(String),

    /// Repeat counter update or delete failed
    #[error("Counter error: {0}")]
    Counter(#[source] CoordinationError),

    /// Engine configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// `start` was called twice
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// Builder finished without a trigger
    #[error("No trigger configured")]
    MissingTrigger,
}

impl SchedulerError {
    /// Whether this error rejects a job or configuration outright, as
    /// opposed to a runtime failure of one occurrence.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::Rhythm(_)
                | SchedulerError::Job(_)
                | SchedulerError::ConflictingRepeats { .. }
                | SchedulerError::PartitionNotOwned(_)
                | SchedulerError::Config(_)
                | SchedulerError::MissingTrigger
        )
    }

    /// Recover an engine error that travelled through a registry listener.
    pub(crate) fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::Listener { name, source } => match source.downcast::<SchedulerError>() {
                Ok(inner) => *inner,
                Err(source) => SchedulerError::Storage(StoreError::Listener { name, source }),
            },
            other => SchedulerError::Storage(other),
        }
    }
}

/// Callback receiving per-occurrence failures.
pub type ErrorHandler = Arc<dyn Fn(&Job, &SchedulerError) + Send + Sync>;

/// Default storage-error handler: logs at error level.
pub fn log_storage_errors() -> ErrorHandler {
    Arc::new(|job: &Job, err: &SchedulerError| {
        error!(job = %job.name, error = %err, "Storage error while firing job");
    })
}

/// Default user-error handler: logs at warn level.
pub fn log_job_errors() -> ErrorHandler {
    Arc::new(|job: &Job, err: &SchedulerError| {
        warn!(job = %job.name, error = %err, "Job error");
    })
}
