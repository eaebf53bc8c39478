//! Durable repeat counters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::CoordinationError;
use crate::kv::{CasOutcome, MemoryKv};

/// Maximum compare-and-swap rounds per increment before giving up.
const MAX_CAS_ATTEMPTS: usize = 16;

/// Durable integer with atomic read-modify-write.
#[async_trait]
pub trait Counter: Send + Sync {
    fn key(&self) -> &str;

    /// Add `delta` and return `(value, updated)`, where `updated` is false
    /// if the write could not be applied.
    async fn increment(&self, delta: i64) -> Result<(i64, bool), CoordinationError>;

    /// Remove the counter. Deleting a missing counter is not an error.
    async fn delete(&self) -> Result<(), CoordinationError>;
}

/// Creates counters seeded at `initial` and leased for `ttl`.
pub trait CounterFactory: Send + Sync {
    fn new_counter(&self, key: &str, initial: i64, ttl: Option<Duration>) -> Arc<dyn Counter>;
}

/// Counter factory backed by a [`MemoryKv`].
#[derive(Debug, Clone)]
pub struct KvCounterFactory {
    kv: MemoryKv,
}

impl KvCounterFactory {
    pub fn new(kv: MemoryKv) -> Self {
        Self { kv }
    }
}

impl CounterFactory for KvCounterFactory {
    fn new_counter(&self, key: &str, initial: i64, ttl: Option<Duration>) -> Arc<dyn Counter> {
        Arc::new(KvCounter {
            kv: self.kv.clone(),
            key: key.to_string(),
            initial,
            ttl,
        })
    }
}

/// Counter stored as a decimal string.
///
/// The key is created lazily by the first increment, so an existing
/// counter keeps its value when the job is rescheduled.
#[derive(Debug)]
pub struct KvCounter {
    kv: MemoryKv,
    key: String,
    initial: i64,
    ttl: Option<Duration>,
}

impl KvCounter {
    fn parse(&self, raw: &[u8]) -> Result<i64, CoordinationError> {
        std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CoordinationError::CorruptValue {
                key: self.key.clone(),
                reason: "counter is not an integer".to_string(),
            })
    }
}

#[async_trait]
impl Counter for KvCounter {
    fn key(&self) -> &str {
        &self.key
    }

    async fn increment(&self, delta: i64) -> Result<(i64, bool), CoordinationError> {
        let mut last_seen = self.initial;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (expected, current) = match self.kv.get(&self.key) {
                Some(kv) => (Some(kv.mod_revision), self.parse(&kv.value)?),
                None => (None, self.initial),
            };
            let next = current.saturating_add(delta);
            last_seen = current;

            match self
                .kv
                .compare_and_swap(&self.key, expected, next.to_string(), self.ttl)
            {
                CasOutcome::Swapped(_) => {
                    debug!(key = %self.key, value = next, "Counter updated");
                    return Ok((next, true));
                }
                CasOutcome::Conflict(_) => continue,
            }
        }

        warn!(key = %self.key, "Counter update lost to concurrent writers");
        Ok((last_seen, false))
    }

    async fn delete(&self) -> Result<(), CoordinationError> {
        self.kv.delete(&self.key);
        Ok(())
    }
}
