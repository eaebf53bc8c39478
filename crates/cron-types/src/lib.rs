//! # cron-types
//!
//! Shared domain types for the shard-cron scheduler.
//!
//! This crate defines the data structures every other crate agrees on:
//! - Job: a named, rhythm-driven unit of work with optional repeat and TTL bounds
//! - TriggerResult: the closed set of outcomes a trigger callback can report
//! - JobRecord: the compact binary form a job is persisted as
//! - Settings: layered configuration for an engine instance
//!
//! ## Usage
//!
//! ```rust
//! use cron_types::Job;
//!
//! let job = Job::new("report", "*/2 * * * * *").with_repeats(3);
//! assert!(job.validate().is_ok());
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod record;

pub use config::{CollectorSettings, LockSettings, PartitionSettings, Settings};
pub use error::CronError;
pub use job::{Job, TriggerResult};
pub use record::JobRecord;
