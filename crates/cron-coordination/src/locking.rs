//! Distributed and local mutexes for occurrence locking.
//!
//! A distributed lock is a leased key created with compare-and-swap. It is
//! never released explicitly: the lease running out is the only way the key
//! becomes free again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};
use ulid::Ulid;

use crate::collector::Collector;
use crate::error::CoordinationError;
use crate::kv::{CasOutcome, KvEvent, MemoryKv, WatchEvent};

/// Cross-process mutual exclusion keyed by string.
#[async_trait]
pub trait DistributedMutex: Send + Sync {
    fn key(&self) -> &str;

    /// Acquire the lock, waiting for the current holder's lease to lapse.
    ///
    /// Callers bound the wait with their own deadline. Acquisition is not
    /// reentrant: a held key blocks every other attempt, including attempts
    /// through this same handle.
    async fn lock(&self) -> Result<(), CoordinationError>;
}

/// Creates distributed mutex sessions.
pub trait MutexBuilder: Send + Sync {
    fn new_mutex(&self, key: &str) -> Result<Arc<dyn DistributedMutex>, CoordinationError>;
}

/// Builds [`KvMutex`]es on a shared [`MemoryKv`].
#[derive(Debug, Clone)]
pub struct KvMutexBuilder {
    kv: MemoryKv,
    lease: Duration,
}

impl KvMutexBuilder {
    pub fn new(kv: MemoryKv, lease: Duration) -> Self {
        Self { kv, lease }
    }
}

impl MutexBuilder for KvMutexBuilder {
    fn new_mutex(&self, key: &str) -> Result<Arc<dyn DistributedMutex>, CoordinationError> {
        Ok(Arc::new(KvMutex {
            kv: self.kv.clone(),
            key: key.to_string(),
            lease: self.lease,
            owner: Ulid::new().to_string(),
        }))
    }
}

/// Lock held as a leased key whose value identifies the owning session.
#[derive(Debug)]
pub struct KvMutex {
    kv: MemoryKv,
    key: String,
    lease: Duration,
    owner: String,
}

#[async_trait]
impl DistributedMutex for KvMutex {
    fn key(&self) -> &str {
        &self.key
    }

    async fn lock(&self) -> Result<(), CoordinationError> {
        loop {
            // Subscribe before trying so a release between the attempt and
            // the wait is not missed.
            let mut watch = self.kv.watch(&self.key);
            let holder = match self.kv.compare_and_swap(
                &self.key,
                None,
                self.owner.clone(),
                Some(self.lease),
            ) {
                CasOutcome::Swapped(_) => {
                    debug!(key = %self.key, owner = %self.owner, "Lock acquired");
                    return Ok(());
                }
                CasOutcome::Conflict(holder) => holder,
            };

            let expires_at = holder.and_then(|h| h.expires_at);
            trace!(key = %self.key, ?expires_at, "Lock held elsewhere, waiting");

            loop {
                let released = async {
                    match expires_at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                let event = tokio::select! {
                    _ = released => break,
                    event = watch.next() => event?,
                };
                match event {
                    WatchEvent::Event(KvEvent::Delete { key, .. }) if key == self.key => break,
                    WatchEvent::Lagged(_) => break,
                    WatchEvent::Event(_) => continue,
                }
            }
        }
    }
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cache of distributed mutex sessions, one per key.
///
/// Sessions are evicted by the collector once idle for its TTL.
#[derive(Clone)]
pub struct MutexStore {
    inner: Arc<MutexStoreInner>,
}

struct MutexStoreInner {
    builder: Arc<dyn MutexBuilder>,
    collector: Collector,
    sessions: Mutex<HashMap<String, Arc<dyn DistributedMutex>>>,
}

impl MutexStore {
    pub fn new(builder: Arc<dyn MutexBuilder>, collector: Collector) -> Self {
        Self {
            inner: Arc::new(MutexStoreInner {
                builder,
                collector,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Cached session for `key`, creating it on first use.
    pub fn get(&self, key: &str) -> Result<Arc<dyn DistributedMutex>, CoordinationError> {
        let mut sessions = locked(&self.inner.sessions);
        if let Some(existing) = sessions.get(key) {
            return Ok(existing.clone());
        }

        let mutex = self.inner.builder.new_mutex(key)?;
        sessions.insert(key.to_string(), mutex.clone());
        drop(sessions);

        let weak: Weak<MutexStoreInner> = Arc::downgrade(&self.inner);
        let evict = key.to_string();
        self.inner.collector.add(move || {
            if let Some(inner) = weak.upgrade() {
                locked(&inner.sessions).remove(&evict);
            }
        });
        Ok(mutex)
    }

    pub fn len(&self) -> usize {
        locked(&self.inner.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Local async mutexes keyed by string, evicted by the collector.
#[derive(Clone)]
pub struct Mutexer {
    inner: Arc<MutexerInner>,
}

struct MutexerInner {
    collector: Collector,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Mutexer {
    pub fn new(collector: Collector) -> Self {
        Self {
            inner: Arc::new(MutexerInner {
                collector,
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = locked(&self.inner.locks);
        if let Some(existing) = locks.get(key) {
            return existing.clone();
        }

        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(key.to_string(), lock.clone());
        drop(locks);

        let weak = Arc::downgrade(&self.inner);
        let evict = key.to_string();
        self.inner.collector.add(move || {
            if let Some(inner) = weak.upgrade() {
                locked(&inner.locks).remove(&evict);
            }
        });
        lock
    }
}
