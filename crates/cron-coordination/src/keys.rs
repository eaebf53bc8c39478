//! Key layout for jobs, occurrence locks and repeat counters.
//!
//! Key format:
//! - jobs:     `{namespace}/partitions/{pid}/jobs/{name}`
//! - locks:    `{namespace}/partitions/{pid}/ticks/{name}/{unix_seconds}`
//! - counters: `{namespace}/partitions/{pid}/counters/{name}`
//!
//! Grouping by partition lets a host range over exactly the keys it owns.

use std::sync::Arc;

use crate::partitioning::Partitioner;

/// Builds storage and lock keys for a namespace.
#[derive(Debug, Clone)]
pub struct Organizer {
    namespace: String,
    partitioner: Arc<dyn Partitioner>,
}

impl Organizer {
    pub fn new(namespace: impl Into<String>, partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            namespace: namespace.into(),
            partitioner,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn partitioner(&self) -> &Arc<dyn Partitioner> {
        &self.partitioner
    }

    /// Partition a job name belongs to
    pub fn partition_of(&self, name: &str) -> u32 {
        self.partitioner.calculate_partition_id(name)
    }

    fn partition_root(&self, partition_id: u32) -> String {
        format!("{}/partitions/{}", self.namespace, partition_id)
    }

    pub fn jobs_path(&self, partition_id: u32) -> String {
        format!("{}/jobs", self.partition_root(partition_id))
    }

    pub fn job_path(&self, name: &str) -> String {
        format!("{}/{}", self.jobs_path(self.partition_of(name)), name)
    }

    /// Prefix of every occurrence lock of one job. The occurrence's Unix
    /// seconds are appended directly, so two jobs due in the same second
    /// never share a lock.
    pub fn tick_lock_path(&self, partition_id: u32, name: &str) -> String {
        format!("{}/ticks/{}/", self.partition_root(partition_id), name)
    }

    pub fn counter_path(&self, partition_id: u32, name: &str) -> String {
        format!("{}/counters/{}", self.partition_root(partition_id), name)
    }

    /// Job name carried by a job key (its last segment).
    pub fn job_name_from_key(key: &str) -> Option<&str> {
        key.rsplit('/').next().filter(|name| !name.is_empty())
    }
}
