//! # cron-scheduler
//!
//! Partition-aware distributed cron engine.
//!
//! Every engine in a fleet shares one coordination store. Jobs are spread
//! over partitions by name; each engine schedules the jobs in the
//! partitions it owns and fires every occurrence under a distributed lock
//! named after the job and the occurrence's second, so an occurrence runs at most once
//! fleet-wide even when ownership overlaps.
//!
//! ## Lifecycle
//!
//! 1. Build a [`Cron`] with [`Cron::builder`], supplying a [`Trigger`]
//! 2. [`Cron::start`] replays stored jobs and starts the loop
//! 3. [`Cron::add_job`] / [`Cron::delete_job`] at any time
//! 4. Cancel the token passed to `start`, then [`Cron::wait`]
//!
//! Jobs may carry a repeat budget (`with_repeats` or an `R<n>/` rhythm)
//! and a TTL. A job is deleted once its budget is used up; a TTL deletes
//! the stored job when its lease runs out.

mod builder;
mod clock;
mod engine;
mod entry;
mod error;
mod operation;
mod trigger;

pub use builder::{CronBuilder, StoreContext};
pub use clock::{Clock, SystemClock, TokioClock};
pub use engine::Cron;
pub use entry::{by_next, Entry};
pub use error::{log_job_errors, log_storage_errors, ErrorHandler, SchedulerError};
pub use operation::Operation;
pub use trigger::{RequestHook, Trigger, TriggerRequest};

pub use cron_types::{Job, TriggerResult};
