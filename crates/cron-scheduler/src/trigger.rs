//! Trigger callbacks and per-occurrence dispatch.
//!
//! Every due entry gets its own task that claims the occurrence with a
//! distributed lock named after the job and the occurrence's Unix second,
//! runs the trigger, then updates the repeat counter. The lock
//! is never released; its lease expiring is what frees it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, Instrument};

use cron_coordination::{Counter, MutexStore, Mutexer};
use cron_store::JobStore;
use cron_types::{Job, TriggerResult};

use crate::entry::Entry;
use crate::error::{ErrorHandler, SchedulerError};

/// Everything a trigger gets to see about one occurrence.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub job_name: String,
    pub metadata: HashMap<String, String>,
    pub payload: Bytes,
    /// Occurrence being fired
    pub scheduled_at: DateTime<Utc>,
    /// Fires when the engine shuts down
    pub cancel: CancellationToken,
}

/// User callback run once per claimed occurrence.
///
/// Runs concurrently for different jobs and for overlapping occurrences of
/// the same job. An `Err` is treated like [`TriggerResult::Failure`].
#[async_trait]
pub trait Trigger: Send + Sync {
    async fn trigger(&self, request: TriggerRequest) -> anyhow::Result<TriggerResult>;
}

#[async_trait]
impl<F, Fut> Trigger for F
where
    F: Fn(TriggerRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<TriggerResult>> + Send + 'static,
{
    async fn trigger(&self, request: TriggerRequest) -> anyhow::Result<TriggerResult> {
        (self)(request).await
    }
}

/// Decorates each request before the trigger sees it.
pub type RequestHook = Arc<dyn Fn(&Job, &mut TriggerRequest) + Send + Sync>;

/// Storage and user error handlers.
#[derive(Clone)]
pub(crate) struct Handlers {
    pub storage: ErrorHandler,
    pub user: ErrorHandler,
}

/// Spawns and runs trigger attempts.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    pub trigger: Arc<dyn Trigger>,
    pub store: Arc<dyn JobStore>,
    pub mutexes: MutexStore,
    pub local: Mutexer,
    pub handlers: Handlers,
    pub hook: Option<RequestHook>,
    pub acquire_timeout: Duration,
    pub cancel: CancellationToken,
}

impl Dispatcher {
    /// Fire-and-forget attempt for `entry` at `at`.
    pub(crate) fn dispatch(&self, entry: Entry, at: DateTime<Utc>) {
        let this = self.clone();
        tokio::spawn(async move { this.attempt(entry, at).await }.in_current_span());
    }

    #[instrument(skip_all, fields(job = %entry.name(), at = %at.timestamp()))]
    pub(crate) async fn attempt(&self, entry: Entry, at: DateTime<Utc>) {
        let key = entry.lock_key(at);
        let mutex = match self.mutexes.get(&key) {
            Ok(mutex) => mutex,
            Err(e) => {
                (self.handlers.storage)(entry.job(), &SchedulerError::Coordination(e));
                return;
            }
        };

        let deadline = Instant::now() + self.acquire_timeout;
        let local = self.local.get(&key);
        let acquire = async {
            let _guard = local.lock().await;
            mutex.lock().await
        };
        let acquired = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(key = %key, "Shutdown while acquiring occurrence lock");
                return;
            }
            acquired = tokio::time::timeout_at(deadline, acquire) => acquired,
        };

        match acquired {
            Err(_) => {
                debug!(key = %key, "Occurrence claimed elsewhere");
                return;
            }
            Ok(Err(source)) => {
                (self.handlers.storage)(entry.job(), &SchedulerError::Lock { key, source });
                return;
            }
            Ok(Ok(())) => {}
        }

        let job = entry.job();
        let mut request = TriggerRequest {
            job_name: job.name.clone(),
            metadata: job.metadata.clone(),
            payload: job.payload.clone(),
            scheduled_at: at,
            cancel: self.cancel.clone(),
        };
        if let Some(hook) = &self.hook {
            hook(job, &mut request);
        }

        match self.trigger.trigger(request).await {
            Err(e) => (self.handlers.user)(job, &SchedulerError::Trigger(e)),
            Ok(TriggerResult::Failure) => {
                (self.handlers.user)(job, &SchedulerError::TriggerFailure(job.name.clone()))
            }
            Ok(TriggerResult::Delete) => {
                debug!("Trigger asked for deletion");
                self.delete_job(&entry).await;
            }
            Ok(TriggerResult::Ok) => {
                debug!("Trigger succeeded");
                if let Some(counter) = entry.counter() {
                    self.count(&entry, counter).await;
                }
            }
        }
    }

    /// Count one successful run and retire the job once its budget is used.
    ///
    /// Counter failures are reported but never undo the run.
    async fn count(&self, entry: &Entry, counter: &Arc<dyn Counter>) {
        let remaining = match counter.increment(-1).await {
            Ok((remaining, true)) => remaining,
            Ok((_, false)) => return,
            Err(e) => {
                (self.handlers.user)(entry.job(), &SchedulerError::Counter(e));
                return;
            }
        };

        debug!(remaining, "Repeat counted");
        if remaining > 0 {
            return;
        }
        self.delete_job(entry).await;
        // The counter's own lease cleans up if this fails.
        if let Err(e) = counter.delete().await {
            (self.handlers.user)(entry.job(), &SchedulerError::Counter(e));
        }
    }

    async fn delete_job(&self, entry: &Entry) {
        if let Err(e) = self.store.delete(entry.name()).await {
            (self.handlers.user)(entry.job(), &SchedulerError::from_store(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use cron_coordination::{
        Collector, CoordinationError, DistributedMutex, KvCounterFactory, CounterFactory,
        KvMutexBuilder, MemoryKv, MutexBuilder,
    };
    use cron_store::StoreError;

    #[derive(Default)]
    struct DeleteLog {
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobStore for DeleteLog {
        async fn start(&self, _cancel: CancellationToken) -> Result<(), StoreError> {
            Ok(())
        }
        async fn put(&self, _job: &Job) -> Result<(), StoreError> {
            Ok(())
        }
        async fn delete(&self, name: &str) -> Result<(), StoreError> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }
        async fn wait(&self) {}
    }

    #[derive(Default)]
    struct Reports {
        storage: Mutex<Vec<String>>,
        user: Mutex<Vec<String>>,
    }

    impl Reports {
        fn handlers(self: &Arc<Self>) -> Handlers {
            let storage = self.clone();
            let user = self.clone();
            Handlers {
                storage: Arc::new(move |_job: &Job, err: &SchedulerError| {
                    storage.storage.lock().unwrap().push(err.to_string());
                }),
                user: Arc::new(move |_job: &Job, err: &SchedulerError| {
                    user.user.lock().unwrap().push(err.to_string());
                }),
            }
        }
    }

    struct Fixture {
        kv: MemoryKv,
        store: Arc<DeleteLog>,
        reports: Arc<Reports>,
        calls: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                kv: MemoryKv::new(),
                store: Arc::new(DeleteLog::default()),
                reports: Arc::new(Reports::default()),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn dispatcher(&self, result: anyhow::Result<TriggerResult>) -> Dispatcher {
            let builder = Arc::new(KvMutexBuilder::new(self.kv.clone(), Duration::from_secs(60)));
            self.dispatcher_with(builder, result)
        }

        fn dispatcher_with(
            &self,
            builder: Arc<dyn MutexBuilder>,
            result: anyhow::Result<TriggerResult>,
        ) -> Dispatcher {
            let collector = Collector::new(Duration::from_secs(3600), Duration::from_secs(60));
            let calls = self.calls.clone();
            let result = Arc::new(result.map_err(|e| e.to_string()));
            let trigger = move |_req: TriggerRequest| {
                let calls = calls.clone();
                let result = result.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    match result.as_ref() {
                        Ok(r) => Ok(*r),
                        Err(msg) => Err(anyhow::anyhow!(msg.clone())),
                    }
                }
            };
            Dispatcher {
                trigger: Arc::new(trigger),
                store: self.store.clone(),
                mutexes: MutexStore::new(builder, collector.clone()),
                local: Mutexer::new(collector),
                handlers: self.reports.handlers(),
                hook: None,
                acquire_timeout: Duration::from_secs(1),
                cancel: CancellationToken::new(),
            }
        }

        fn entry(&self, job: Job) -> Entry {
            let schedule = cron_rhythm::parse(&job.rhythm).unwrap().schedule;
            let counter = job.repeat_limit().map(|r| {
                KvCounterFactory::new(self.kv.clone()).new_counter(
                    &format!("counters/{}", job.name),
                    i64::from(r),
                    None,
                )
            });
            Entry::new(job, schedule, "ticks/", counter)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn deleted(&self) -> Vec<String> {
            self.store.deleted.lock().unwrap().clone()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_attempts_fire_once() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(Ok(TriggerResult::Ok));
        let entry = fx.entry(Job::new("a", "@every 1s"));

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let d = dispatcher.clone();
                let e = entry.clone();
                tokio::spawn(async move { d.attempt(e, at(10)).await })
            })
            .collect();
        for attempt in attempts {
            attempt.await.unwrap();
        }

        assert_eq!(fx.calls(), 1);
        assert!(fx.reports.storage.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_engines_fire_once_per_occurrence() {
        let fx = Fixture::new();
        let a = fx.dispatcher(Ok(TriggerResult::Ok));
        let b = fx.dispatcher(Ok(TriggerResult::Ok));
        let entry = fx.entry(Job::new("a", "@every 1s"));

        tokio::join!(a.attempt(entry.clone(), at(10)), b.attempt(entry.clone(), at(10)));
        assert_eq!(fx.calls(), 1);

        // Next second is a different occurrence
        tokio::join!(a.attempt(entry.clone(), at(11)), b.attempt(entry.clone(), at(11)));
        assert_eq!(fx.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_goes_to_user_handler() {
        let fx = Fixture::new();
        fx.dispatcher(Ok(TriggerResult::Failure))
            .attempt(fx.entry(Job::new("a", "@every 1s")), at(1))
            .await;

        let user = fx.reports.user.lock().unwrap().clone();
        assert_eq!(user, vec!["Trigger reported failure for job a".to_string()]);
        assert!(fx.deleted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_goes_to_user_handler() {
        let fx = Fixture::new();
        fx.dispatcher(Err(anyhow::anyhow!("downstream unavailable")))
            .attempt(fx.entry(Job::new("a", "@every 1s").with_repeats(1)), at(1))
            .await;

        let user = fx.reports.user.lock().unwrap().clone();
        assert_eq!(user, vec!["Trigger failed: downstream unavailable".to_string()]);
        // Failed runs do not count against the budget
        assert!(fx.kv.get("counters/a").is_none());
        assert!(fx.deleted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_result_removes_job() {
        let fx = Fixture::new();
        fx.dispatcher(Ok(TriggerResult::Delete))
            .attempt(fx.entry(Job::new("a", "@every 1s")), at(1))
            .await;
        assert_eq!(fx.deleted(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_budget_deletes_job_and_counter() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(Ok(TriggerResult::Ok));
        let entry = fx.entry(Job::new("a", "@every 1s").with_repeats(2));

        dispatcher.attempt(entry.clone(), at(1)).await;
        assert_eq!(fx.kv.get("counters/a").unwrap().value.as_ref(), b"1");
        assert!(fx.deleted().is_empty());

        dispatcher.attempt(entry.clone(), at(2)).await;
        assert_eq!(fx.deleted(), vec!["a".to_string()]);
        assert!(fx.kv.get("counters/a").is_none());
        assert_eq!(fx.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_hook_decorates_request() {
        let fx = Fixture::new();
        let seen = Arc::new(Mutex::new(None));
        let mut dispatcher = fx.dispatcher(Ok(TriggerResult::Ok));
        let sink = seen.clone();
        dispatcher.trigger = Arc::new(move |req: TriggerRequest| {
            *sink.lock().unwrap() = Some(req.metadata);
            std::future::ready(Ok::<_, anyhow::Error>(TriggerResult::Ok))
        });
        dispatcher.hook = Some(Arc::new(|job: &Job, req: &mut TriggerRequest| {
            req.metadata.insert("partition_key".to_string(), job.name.to_uppercase());
        }));

        let job = Job::new("a", "@every 1s").with_metadata("team", "billing");
        dispatcher.attempt(fx.entry(job), at(1)).await;

        let metadata = seen.lock().unwrap().clone().unwrap();
        assert_eq!(metadata.get("team").map(String::as_str), Some("billing"));
        assert_eq!(metadata.get("partition_key").map(String::as_str), Some("A"));
    }

    struct BrokenBuilder;

    impl MutexBuilder for BrokenBuilder {
        fn new_mutex(&self, key: &str) -> Result<Arc<dyn DistributedMutex>, CoordinationError> {
            Err(CoordinationError::CorruptValue {
                key: key.to_string(),
                reason: "session refused".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_failure_goes_to_storage_handler() {
        let fx = Fixture::new();
        fx.dispatcher_with(Arc::new(BrokenBuilder), Ok(TriggerResult::Ok))
            .attempt(fx.entry(Job::new("a", "@every 1s")), at(1))
            .await;

        assert_eq!(fx.calls(), 0);
        assert_eq!(fx.reports.storage.lock().unwrap().len(), 1);
        assert!(fx.reports.user.lock().unwrap().is_empty());
    }

    struct FailingMutex(String);

    #[async_trait]
    impl DistributedMutex for FailingMutex {
        fn key(&self) -> &str {
            &self.0
        }
        async fn lock(&self) -> Result<(), CoordinationError> {
            Err(CoordinationError::WatchClosed)
        }
    }

    struct FailingBuilder;

    impl MutexBuilder for FailingBuilder {
        fn new_mutex(&self, key: &str) -> Result<Arc<dyn DistributedMutex>, CoordinationError> {
            Ok(Arc::new(FailingMutex(key.to_string())))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_failure_goes_to_storage_handler() {
        let fx = Fixture::new();
        fx.dispatcher_with(Arc::new(FailingBuilder), Ok(TriggerResult::Ok))
            .attempt(fx.entry(Job::new("a", "@every 1s")), at(7))
            .await;

        assert_eq!(fx.calls(), 0);
        let storage = fx.reports.storage.lock().unwrap().clone();
        assert_eq!(storage.len(), 1);
        assert!(storage[0].contains("ticks/7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_timeout_is_silent() {
        let fx = Fixture::new();
        // Occurrence already claimed by another process
        fx.kv.put("ticks/5", "someone-else", Some(Duration::from_secs(60)));

        let started = Instant::now();
        fx.dispatcher(Ok(TriggerResult::Ok))
            .attempt(fx.entry(Job::new("a", "@every 1s")), at(5))
            .await;

        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(fx.calls(), 0);
        assert!(fx.reports.storage.lock().unwrap().is_empty());
        assert!(fx.reports.user.lock().unwrap().is_empty());
    }
}
