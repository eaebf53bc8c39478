//! Partition assignment.
//!
//! Job names hash into a fixed number of partitions; each host owns a
//! subset of them and only schedules jobs from partitions it owns.

use std::fmt;

use cron_types::PartitionSettings;

use crate::error::CoordinationError;

/// Maps job names to partitions and answers ownership questions.
pub trait Partitioner: Send + Sync + fmt::Debug {
    /// Partition a job name hashes into.
    fn calculate_partition_id(&self, key: &str) -> u32;

    /// Whether this host owns `partition_id`.
    fn check_partition_leader(&self, partition_id: u32) -> bool;

    /// Partitions owned by this host, ascending.
    fn list_partitions(&self) -> Vec<u32>;
}

/// Single partition, always owned. Every host schedules every job and the
/// per-occurrence lock alone provides exclusion.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPartitioning;

impl Partitioner for NoPartitioning {
    fn calculate_partition_id(&self, _key: &str) -> u32 {
        0
    }

    fn check_partition_leader(&self, _partition_id: u32) -> bool {
        true
    }

    fn list_partitions(&self) -> Vec<u32> {
        vec![0]
    }
}

/// Fixed partition count spread round-robin over a fixed host count.
///
/// Host `h` owns every partition `p` with `p % num_hosts == h`.
#[derive(Debug, Clone)]
pub struct StaticPartitioning {
    num_partitions: u32,
    num_hosts: u32,
    host_id: u32,
}

impl StaticPartitioning {
    pub fn new(num_partitions: u32, num_hosts: u32, host_id: u32) -> Result<Self, CoordinationError> {
        if num_partitions == 0 {
            return Err(CoordinationError::InvalidPartitioning(
                "num_partitions must be > 0".to_string(),
            ));
        }
        if num_hosts == 0 {
            return Err(CoordinationError::InvalidPartitioning(
                "num_hosts must be > 0".to_string(),
            ));
        }
        if host_id >= num_hosts {
            return Err(CoordinationError::InvalidPartitioning(format!(
                "host_id {} out of range for {} hosts",
                host_id, num_hosts
            )));
        }
        Ok(Self {
            num_partitions,
            num_hosts,
            host_id,
        })
    }

    pub fn from_settings(settings: &PartitionSettings) -> Result<Self, CoordinationError> {
        Self::new(settings.num_partitions, settings.num_hosts, settings.host_id)
    }
}

impl Partitioner for StaticPartitioning {
    fn calculate_partition_id(&self, key: &str) -> u32 {
        (fnv1a(key.as_bytes()) % u64::from(self.num_partitions)) as u32
    }

    fn check_partition_leader(&self, partition_id: u32) -> bool {
        partition_id < self.num_partitions && partition_id % self.num_hosts == self.host_id
    }

    fn list_partitions(&self) -> Vec<u32> {
        (self.host_id..self.num_partitions)
            .step_by(self.num_hosts as usize)
            .collect()
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}
