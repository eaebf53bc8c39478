//! Registry without persistence.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cron_types::Job;

use crate::{JobListener, JobStore, StoreError};

/// Calls the listener directly; nothing survives a restart.
///
/// Listener errors propagate to the caller of `put` and `delete`.
pub struct NoStore {
    listener: Arc<dyn JobListener>,
}

impl NoStore {
    pub fn new(listener: Arc<dyn JobListener>) -> Self {
        Self { listener }
    }
}

#[async_trait]
impl JobStore for NoStore {
    async fn start(&self, _cancel: CancellationToken) -> Result<(), StoreError> {
        Ok(())
    }

    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        self.listener
            .on_put(job.clone())
            .await
            .map_err(|source| StoreError::Listener {
                name: job.name.clone(),
                source,
            })
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.listener
            .on_delete(name)
            .await
            .map_err(|source| StoreError::Listener {
                name: name.to_string(),
                source,
            })
    }

    async fn wait(&self) {}
}
