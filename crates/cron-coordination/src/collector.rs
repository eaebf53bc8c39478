//! Idle-session collector.
//!
//! Cached lock sessions and local mutexes register a cleanup here when they
//! are created. Once a cleanup is older than the TTL, the next sweep runs it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type Cleanup = Box<dyn FnOnce() + Send>;

/// TTL-based sweeper of registered cleanups.
#[derive(Clone)]
pub struct Collector {
    queue: Arc<Mutex<VecDeque<(Instant, Cleanup)>>>,
    ttl: Duration,
    period: Duration,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("ttl", &self.ttl)
            .field("period", &self.period)
            .field("pending", &self.len())
            .finish()
    }
}

impl Collector {
    pub fn new(ttl: Duration, period: Duration) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            ttl,
            period,
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<(Instant, Cleanup)>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a cleanup to run once it is older than the TTL.
    pub fn add(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.queue().push_back((Instant::now(), Box::new(cleanup)));
    }

    /// Number of cleanups waiting to run.
    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every cleanup older than the TTL. Returns how many ran.
    pub fn collect(&self) -> usize {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut queue = self.queue();
            while let Some((added, _)) = queue.front() {
                if now.duration_since(*added) < self.ttl {
                    break;
                }
                if let Some((_, cleanup)) = queue.pop_front() {
                    due.push(cleanup);
                }
            }
        }

        let count = due.len();
        for cleanup in due {
            cleanup();
        }
        count
    }

    /// Sweep every period until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(ttl = ?self.ttl, period = ?self.period, "Collector started");
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let collected = self.collect();
                    if collected > 0 {
                        debug!(collected, "Collected idle sessions");
                    }
                }
            }
        }
        info!("Collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_collect_runs_only_expired() {
        let collector = Collector::new(Duration::from_secs(10), Duration::from_secs(1));
        let ran = Arc::new(AtomicUsize::new(0));

        let r = ran.clone();
        collector.add(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::advance(Duration::from_secs(5)).await;
        let r = ran.clone();
        collector.add(move || {
            r.fetch_add(10, Ordering::SeqCst);
        });

        assert_eq!(collector.collect(), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(collector.collect(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(collector.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_until_cancelled() {
        let collector = Collector::new(Duration::from_secs(2), Duration::from_secs(1));
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        collector.add(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(collector.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(collector.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
