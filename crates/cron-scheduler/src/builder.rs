//! Engine construction.

use std::sync::Arc;

use cron_coordination::{
    Collector, CounterFactory, KvCounterFactory, KvMutexBuilder, MemoryKv, MutexBuilder,
    MutexStore, Mutexer, Organizer, Partitioner, StaticPartitioning,
};
use cron_store::{JobListener, JobStore, KvJobStore, NoStore};
use cron_types::{Job, Settings};

use crate::clock::{Clock, SystemClock};
use crate::engine::{Core, CoreListener, Cron, Wiring};
use crate::error::{log_job_errors, log_storage_errors, ErrorHandler, SchedulerError};
use crate::trigger::{Handlers, RequestHook, Trigger, TriggerRequest};

/// What a custom registry gets to work with.
pub struct StoreContext {
    pub kv: MemoryKv,
    pub organizer: Organizer,
    /// Engine callbacks the registry must report jobs to
    pub listener: Arc<dyn JobListener>,
}

type StoreFactory = Box<dyn FnOnce(StoreContext) -> Arc<dyn JobStore> + Send>;

/// Builder for [`Cron`].
///
/// Everything but the trigger has a default: settings from
/// [`Settings::default`], a fresh [`MemoryKv`], static partitioning from the
/// settings, leased locks and counters on the KV store, a [`KvJobStore`],
/// logging error handlers and the system clock.
pub struct CronBuilder {
    settings: Settings,
    kv: Option<MemoryKv>,
    partitioner: Option<Arc<dyn Partitioner>>,
    trigger: Option<Arc<dyn Trigger>>,
    storage_errors: ErrorHandler,
    user_errors: ErrorHandler,
    hook: Option<RequestHook>,
    clock: Arc<dyn Clock>,
    mutex_builder: Option<Arc<dyn MutexBuilder>>,
    counters: Option<Arc<dyn CounterFactory>>,
    store: Option<StoreFactory>,
}

impl Default for CronBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CronBuilder {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            kv: None,
            partitioner: None,
            trigger: None,
            storage_errors: log_storage_errors(),
            user_errors: log_job_errors(),
            hook: None,
            clock: Arc::new(SystemClock),
            mutex_builder: None,
            counters: None,
            store: None,
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Coordination store shared with the other engines of the fleet.
    pub fn kv(mut self, kv: MemoryKv) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Overrides the partitioning described by the settings.
    pub fn partitioning(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = Some(partitioner);
        self
    }

    pub fn trigger(mut self, trigger: impl Trigger + 'static) -> Self {
        self.trigger = Some(Arc::new(trigger));
        self
    }

    /// Handler for registry, lease and lock failures.
    pub fn storage_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.storage_errors = handler;
        self
    }

    /// Handler for trigger and repeat-counter failures.
    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.user_errors = handler;
        self
    }

    /// Adjust every request before it reaches the trigger, e.g. to add
    /// metadata derived from the job.
    pub fn request_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Job, &mut TriggerRequest) + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn mutex_builder(mut self, builder: Arc<dyn MutexBuilder>) -> Self {
        self.mutex_builder = Some(builder);
        self
    }

    pub fn counter_factory(mut self, counters: Arc<dyn CounterFactory>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Use a custom registry built from the engine's context.
    pub fn job_store<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(StoreContext) -> Arc<dyn JobStore> + Send + 'static,
    {
        self.store = Some(Box::new(factory));
        self
    }

    /// Keep jobs in memory only; nothing is replayed on start.
    pub fn without_persistence(self) -> Self {
        self.job_store(|ctx| -> Arc<dyn JobStore> { Arc::new(NoStore::new(ctx.listener)) })
    }

    /// # Errors
    ///
    /// Returns `SchedulerError::MissingTrigger` if no trigger was set and
    /// `SchedulerError::Config` if the settings do not validate.
    pub fn build(self) -> Result<Cron, SchedulerError> {
        let trigger = self.trigger.ok_or(SchedulerError::MissingTrigger)?;
        self.settings
            .validate()
            .map_err(|e| SchedulerError::Config(e.to_string()))?;
        let tz = self
            .settings
            .parse_timezone()
            .map_err(|e| SchedulerError::Config(e.to_string()))?;

        let partitioner: Arc<dyn Partitioner> = match self.partitioner {
            Some(partitioner) => partitioner,
            None => Arc::new(
                StaticPartitioning::from_settings(&self.settings.partitioning)
                    .map_err(|e| SchedulerError::Config(e.to_string()))?,
            ),
        };
        let organizer = Organizer::new(self.settings.namespace.clone(), partitioner);
        let kv = self.kv.unwrap_or_default();

        let mutex_builder: Arc<dyn MutexBuilder> = match self.mutex_builder {
            Some(builder) => builder,
            None => Arc::new(KvMutexBuilder::new(kv.clone(), self.settings.lock.lease_ttl())),
        };
        let counters: Arc<dyn CounterFactory> = match self.counters {
            Some(counters) => counters,
            None => Arc::new(KvCounterFactory::new(kv.clone())),
        };
        let collector = Collector::new(
            self.settings.collector.ttl(),
            self.settings.collector.period(),
        );

        let core = Arc::new(Core::new(
            organizer.clone(),
            tz,
            counters,
            self.clock,
            self.user_errors.clone(),
        ));
        let context = StoreContext {
            kv,
            organizer,
            listener: Arc::new(CoreListener(core.clone())),
        };
        let store: Arc<dyn JobStore> = match self.store {
            Some(factory) => factory(context),
            None => Arc::new(KvJobStore::new(context.kv, context.organizer, context.listener)),
        };

        let wiring = Wiring {
            trigger,
            handlers: Handlers {
                storage: self.storage_errors,
                user: self.user_errors,
            },
            hook: self.hook,
            mutexes: MutexStore::new(mutex_builder, collector.clone()),
            local: Mutexer::new(collector.clone()),
            collector,
            acquire_timeout: self.settings.lock.acquire_timeout(),
        };
        Ok(Cron::assemble(core, store, wiring))
    }
}
