//! Coordination primitives for shard-cron.
//!
//! The scheduling engine talks to its collaborators through the traits
//! defined here ([`Partitioner`], [`DistributedMutex`], [`MutexBuilder`],
//! [`Counter`], [`CounterFactory`]). Each has an implementation on top of
//! [`MemoryKv`], an in-process store with leases, compare-and-swap and
//! prefix watches.

pub mod collector;
pub mod counting;
pub mod error;
pub mod keys;
pub mod kv;
pub mod locking;
pub mod partitioning;

pub use collector::Collector;
pub use counting::{Counter, CounterFactory, KvCounter, KvCounterFactory};
pub use error::CoordinationError;
pub use keys::Organizer;
pub use kv::{CasOutcome, KeyValue, KvEvent, MemoryKv, Watch, WatchEvent};
pub use locking::{DistributedMutex, KvMutex, KvMutexBuilder, MutexBuilder, MutexStore, Mutexer};
pub use partitioning::{NoPartitioning, Partitioner, StaticPartitioning};
