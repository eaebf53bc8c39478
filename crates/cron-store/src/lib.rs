//! # cron-store
//!
//! Job registry for shard-cron.
//!
//! A [`JobStore`] persists job definitions and tells a [`JobListener`]
//! about them: once per existing job when it starts, then for every later
//! put or delete.
//!
//! - [`KvJobStore`]: jobs live in a [`cron_coordination::MemoryKv`] under
//!   per-partition prefixes; only partitions owned by this host are replayed
//!   and watched.
//! - [`NoStore`]: nothing is persisted; puts and deletes go straight to the
//!   listener.

mod error;
mod kv_store;
mod no_store;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cron_types::Job;

pub use error::{ListenerError, StoreError};
pub use kv_store::KvJobStore;
pub use no_store::NoStore;

/// Receives job changes from a [`JobStore`].
#[async_trait]
pub trait JobListener: Send + Sync {
    /// A job was created or replaced.
    async fn on_put(&self, job: Job) -> Result<(), ListenerError>;

    /// A job was deleted or its lease expired.
    async fn on_delete(&self, name: &str) -> Result<(), ListenerError>;
}

/// Durable job registry.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Replay existing jobs to the listener, then stream later changes
    /// until `cancel` fires. Fails only if the replay fails.
    async fn start(&self, cancel: CancellationToken) -> Result<(), StoreError>;

    /// Persist or overwrite a job. A TTL binds the record to a lease.
    async fn put(&self, job: &Job) -> Result<(), StoreError>;

    /// Remove a job. Removing a missing job is not an error.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Wait for background streaming to exit after cancellation.
    async fn wait(&self);
}
