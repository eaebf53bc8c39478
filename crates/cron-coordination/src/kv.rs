//! In-process, lease-backed key/value store.
//!
//! `MemoryKv` models the subset of a coordination service the scheduler
//! needs: a revisioned map, keys bound to leases that expire after a TTL,
//! compare-and-swap, prefix range and prefix watch. Every clone shares the
//! same state, so engines holding clones of one store behave like a fleet
//! sharing one cluster.
//!
//! Expired keys are purged lazily on every access and proactively by a
//! reaper task that is spawned with the first leased write. Purges emit
//! `Delete` events exactly like explicit deletes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::CoordinationError;

const EVENT_CAPACITY: usize = 4096;

/// Snapshot of a stored key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    pub create_revision: i64,
    pub mod_revision: i64,
    /// Instant the key's lease runs out, if it has one
    pub expires_at: Option<Instant>,
}

/// Change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvEvent {
    Put(KeyValue),
    Delete { key: String, mod_revision: i64 },
}

impl KvEvent {
    pub fn key(&self) -> &str {
        match self {
            KvEvent::Put(kv) => &kv.key,
            KvEvent::Delete { key, .. } => key,
        }
    }
}

/// Outcome of [`MemoryKv::compare_and_swap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// Write applied at this revision
    Swapped(i64),
    /// Precondition failed; carries the current value, if any
    Conflict(Option<KeyValue>),
}

struct Record {
    value: Bytes,
    create_revision: i64,
    mod_revision: i64,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    revision: i64,
    data: BTreeMap<String, Record>,
    expiries: BTreeSet<(Instant, String)>,
    reaper_started: bool,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<KvEvent>,
    wake: Arc<Notify>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // lets the reaper observe that the store is gone
        self.wake.notify_one();
    }
}

/// Shared in-memory key/value store. Cloning is cheap.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Inner>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("MemoryKv")
            .field("revision", &state.revision)
            .field("keys", &state.data.len())
            .finish()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
                wake: Arc::new(Notify::new()),
            }),
        }
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        let mut state = self.inner.lock();
        self.inner.purge_expired(&mut state, Instant::now());
        state.revision
    }

    /// Write `value` at `key`, bound to a fresh lease of `ttl` when given.
    /// Returns the revision of the write.
    pub fn put(&self, key: &str, value: impl Into<Bytes>, ttl: Option<Duration>) -> i64 {
        let now = Instant::now();
        let mut state = self.inner.lock();
        self.inner.purge_expired(&mut state, now);
        let expires_at = ttl.map(|t| now + t);
        let revision = self.inner.write(&mut state, key, value.into(), expires_at);
        drop(state);

        if expires_at.is_some() {
            self.ensure_reaper();
        }
        revision
    }

    pub fn get(&self, key: &str) -> Option<KeyValue> {
        let mut state = self.inner.lock();
        self.inner.purge_expired(&mut state, Instant::now());
        state.data.get(key).map(|r| key_value(key, r))
    }

    /// Remove `key`. Returns whether it existed; deleting a missing key is
    /// not an error.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.inner.lock();
        self.inner.purge_expired(&mut state, Instant::now());
        self.inner.remove(&mut state, key)
    }

    /// Conditionally write `key`.
    ///
    /// With `expected = None` the write only applies if the key is absent,
    /// and the new key gets a lease of `ttl_on_create`. With
    /// `expected = Some(rev)` it only applies if the key's `mod_revision`
    /// equals `rev`; the key keeps its existing lease.
    pub fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<i64>,
        value: impl Into<Bytes>,
        ttl_on_create: Option<Duration>,
    ) -> CasOutcome {
        let now = Instant::now();
        let mut state = self.inner.lock();
        self.inner.purge_expired(&mut state, now);

        let current = state.data.get(key);
        let expires_at = match (expected, current) {
            (None, None) => ttl_on_create.map(|t| now + t),
            (Some(rev), Some(record)) if record.mod_revision == rev => record.expires_at,
            (_, current) => {
                return CasOutcome::Conflict(current.map(|r| key_value(key, r)));
            }
        };

        let revision = self.inner.write(&mut state, key, value.into(), expires_at);
        drop(state);

        if expires_at.is_some() {
            self.ensure_reaper();
        }
        CasOutcome::Swapped(revision)
    }

    /// All live keys starting with `prefix`, in key order.
    pub fn range(&self, prefix: &str) -> Vec<KeyValue> {
        let mut state = self.inner.lock();
        self.inner.purge_expired(&mut state, Instant::now());
        collect_prefix(&state, prefix)
    }

    /// Subscribe to changes under `prefix`.
    pub fn watch(&self, prefix: &str) -> Watch {
        Watch {
            prefix: prefix.to_string(),
            rx: self.inner.events.subscribe(),
        }
    }

    /// Snapshot `prefix` and subscribe to it atomically: every change after
    /// the snapshot is delivered on the watch, and none before it.
    pub fn range_and_watch(&self, prefix: &str) -> (Vec<KeyValue>, Watch) {
        let mut state = self.inner.lock();
        self.inner.purge_expired(&mut state, Instant::now());
        let watch = self.watch(prefix);
        (collect_prefix(&state, prefix), watch)
    }

    fn ensure_reaper(&self) {
        {
            let mut state = self.inner.lock();
            if state.reaper_started {
                self.inner.wake.notify_one();
                return;
            }
            // No runtime means no reaper; lazy purging still applies.
            if tokio::runtime::Handle::try_current().is_err() {
                return;
            }
            state.reaper_started = true;
        }

        let weak = Arc::downgrade(&self.inner);
        let wake = self.inner.wake.clone();
        tokio::spawn(reap(weak, wake));
    }
}

async fn reap(weak: Weak<Inner>, wake: Arc<Notify>) {
    loop {
        let next = match weak.upgrade() {
            Some(inner) => {
                let mut state = inner.lock();
                inner.purge_expired(&mut state, Instant::now());
                let earliest = state.expiries.first().map(|(at, _)| *at);
                earliest
            }
            None => break,
        };

        match next {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }
    }
    trace!("kv reaper exiting");
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, state: &mut State, key: &str, value: Bytes, expires_at: Option<Instant>) -> i64 {
        state.revision += 1;
        let revision = state.revision;

        let create_revision = match state.data.remove(key) {
            Some(old) => {
                if let Some(at) = old.expires_at {
                    state.expiries.remove(&(at, key.to_string()));
                }
                old.create_revision
            }
            None => revision,
        };
        if let Some(at) = expires_at {
            state.expiries.insert((at, key.to_string()));
        }

        let record = Record {
            value,
            create_revision,
            mod_revision: revision,
            expires_at,
        };
        let _ = self.events.send(KvEvent::Put(key_value(key, &record)));
        state.data.insert(key.to_string(), record);
        revision
    }

    fn remove(&self, state: &mut State, key: &str) -> bool {
        let Some(old) = state.data.remove(key) else {
            return false;
        };
        if let Some(at) = old.expires_at {
            state.expiries.remove(&(at, key.to_string()));
        }
        state.revision += 1;
        let _ = self.events.send(KvEvent::Delete {
            key: key.to_string(),
            mod_revision: state.revision,
        });
        true
    }

    fn purge_expired(&self, state: &mut State, now: Instant) {
        while let Some((at, key)) = state.expiries.first().cloned() {
            if at > now {
                break;
            }
            debug!(key = %key, "lease expired");
            self.remove(state, &key);
        }
    }
}

fn key_value(key: &str, record: &Record) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: record.value.clone(),
        create_revision: record.create_revision,
        mod_revision: record.mod_revision,
        expires_at: record.expires_at,
    }
}

fn collect_prefix(state: &State, prefix: &str) -> Vec<KeyValue> {
    state
        .data
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, r)| key_value(k, r))
        .collect()
}

/// Prefix-filtered change stream.
#[derive(Debug)]
pub struct Watch {
    prefix: String,
    rx: broadcast::Receiver<KvEvent>,
}

/// Item yielded by [`Watch::next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Event(KvEvent),
    /// The watcher fell behind and `n` events were dropped; callers must
    /// resynchronize from a fresh range.
    Lagged(u64),
}

impl Watch {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Next change under the prefix.
    pub async fn next(&mut self) -> Result<WatchEvent, CoordinationError> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key().starts_with(&self.prefix) => {
                    return Ok(WatchEvent::Event(event));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => return Ok(WatchEvent::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CoordinationError::WatchClosed)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let kv = MemoryKv::new();
        let rev = kv.put("a/1", "one", None);
        let got = kv.get("a/1").unwrap();
        assert_eq!(got.value.as_ref(), b"one");
        assert_eq!(got.mod_revision, rev);
        assert_eq!(got.create_revision, rev);

        kv.put("a/1", "uno", None);
        let got = kv.get("a/1").unwrap();
        assert_eq!(got.create_revision, rev);
        assert!(got.mod_revision > rev);

        assert!(kv.delete("a/1"));
        assert!(!kv.delete("a/1"));
        assert!(kv.get("a/1").is_none());
    }

    #[test]
    fn test_range_is_prefix_scoped() {
        let kv = MemoryKv::new();
        kv.put("ns/jobs/a", "1", None);
        kv.put("ns/jobs/b", "2", None);
        kv.put("ns/jobsx", "3", None);
        kv.put("ns/ticks/1", "4", None);

        let keys: Vec<_> = kv.range("ns/jobs/").into_iter().map(|kv| kv.key).collect();
        assert_eq!(keys, vec!["ns/jobs/a".to_string(), "ns/jobs/b".to_string()]);
    }

    #[test]
    fn test_compare_and_swap() {
        let kv = MemoryKv::new();
        let CasOutcome::Swapped(rev) = kv.compare_and_swap("k", None, "v1", None) else {
            panic!("create should succeed");
        };
        assert!(matches!(
            kv.compare_and_swap("k", None, "v2", None),
            CasOutcome::Conflict(Some(_))
        ));
        assert!(matches!(
            kv.compare_and_swap("k", Some(rev + 100), "v2", None),
            CasOutcome::Conflict(Some(_))
        ));
        assert!(matches!(
            kv.compare_and_swap("k", Some(rev), "v2", None),
            CasOutcome::Swapped(_)
        ));
        assert!(matches!(
            kv.compare_and_swap("missing", Some(1), "v", None),
            CasOutcome::Conflict(None)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_emits_delete() {
        let kv = MemoryKv::new();
        let mut watch = kv.watch("leased/");
        kv.put("leased/a", "x", Some(Duration::from_secs(10)));

        assert!(matches!(watch.next().await.unwrap(), WatchEvent::Event(KvEvent::Put(_))));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(kv.get("leased/a").is_some());

        // Reaper fires the delete without any further access
        let event = watch.next().await.unwrap();
        match event {
            WatchEvent::Event(KvEvent::Delete { key, .. }) => assert_eq!(key, "leased/a"),
            other => panic!("expected delete, got {:?}", other),
        }
        assert!(kv.get("leased/a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cas_update_keeps_lease() {
        let kv = MemoryKv::new();
        let CasOutcome::Swapped(rev) =
            kv.compare_and_swap("c", None, "3", Some(Duration::from_secs(5)))
        else {
            panic!("create should succeed");
        };
        let expires = kv.get("c").unwrap().expires_at;
        assert!(expires.is_some());

        kv.compare_and_swap("c", Some(rev), "2", Some(Duration::from_secs(500)));
        assert_eq!(kv.get("c").unwrap().expires_at, expires);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(kv.get("c").is_none());
    }

    #[tokio::test]
    async fn test_range_and_watch_sees_later_changes() {
        let kv = MemoryKv::new();
        kv.put("p/a", "1", None);
        let (snapshot, mut watch) = kv.range_and_watch("p/");
        assert_eq!(snapshot.len(), 1);

        kv.put("other/x", "ignored", None);
        kv.delete("p/a");
        match watch.next().await.unwrap() {
            WatchEvent::Event(KvEvent::Delete { key, .. }) => assert_eq!(key, "p/a"),
            other => panic!("expected delete, got {:?}", other),
        }
    }
}
