//! The scheduling engine.
//!
//! A single loop task owns the entry table. Adds, removes and snapshots are
//! buffered until [`Cron::start`] and handed to the loop over a bounded
//! channel afterwards, so the table is never touched from two tasks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use cron_coordination::{Collector, CounterFactory, MutexStore, Mutexer, Organizer};
use cron_rhythm::Schedule;
use cron_store::{JobListener, JobStore, ListenerError};
use cron_types::Job;

use crate::builder::CronBuilder;
use crate::clock::Clock;
use crate::entry::Entry;
use crate::error::{ErrorHandler, SchedulerError};
use crate::operation::{EntryTable, Operation};
use crate::trigger::{Dispatcher, Handlers, RequestHook, Trigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

/// Operations submitted before the loop exists, plus the loop's phase.
struct Handoff {
    phase: Phase,
    pending: Vec<Operation>,
}

/// State shared by the public handle, the registry listener and the loop.
pub(crate) struct Core {
    organizer: Organizer,
    tz: Tz,
    counters: Arc<dyn CounterFactory>,
    clock: Arc<dyn Clock>,
    /// Receives counter failures raised outside a trigger attempt
    user_errors: ErrorHandler,
    handoff: Mutex<Handoff>,
    live_tx: mpsc::Sender<Operation>,
    live_rx: Mutex<Option<mpsc::Receiver<Operation>>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Core {
    pub(crate) fn new(
        organizer: Organizer,
        tz: Tz,
        counters: Arc<dyn CounterFactory>,
        clock: Arc<dyn Clock>,
        user_errors: ErrorHandler,
    ) -> Self {
        let (live_tx, live_rx) = mpsc::channel(1);
        Self {
            organizer,
            tz,
            counters,
            clock,
            user_errors,
            handoff: Mutex::new(Handoff {
                phase: Phase::Idle,
                pending: Vec::new(),
            }),
            live_tx,
            live_rx: Mutex::new(Some(live_rx)),
        }
    }

    fn phase(&self) -> Phase {
        locked(&self.handoff).phase
    }

    /// Queue before start, hand off while running, drop after stop.
    async fn submit(&self, op: Operation) {
        {
            let mut handoff = locked(&self.handoff);
            match handoff.phase {
                Phase::Idle => {
                    // Snapshots are only answered by a running loop.
                    if !matches!(op, Operation::Snapshot(_)) {
                        handoff.pending.push(op);
                    }
                    return;
                }
                Phase::Stopped => return,
                Phase::Running => {}
            }
        }
        // Fails only once the loop has exited.
        let _ = self.live_tx.send(op).await;
    }

    /// Flip to running and take everything queued so far.
    fn go_live(&self) -> Vec<Operation> {
        let mut handoff = locked(&self.handoff);
        handoff.phase = Phase::Running;
        std::mem::take(&mut handoff.pending)
    }

    fn stop(&self) {
        let mut handoff = locked(&self.handoff);
        handoff.phase = Phase::Stopped;
        handoff.pending.clear();
    }

    /// Parse the rhythm and settle the repeat bound.
    fn compile(&self, job: &Job) -> Result<(Arc<dyn Schedule>, Option<u32>), SchedulerError> {
        let rhythm = cron_rhythm::parse_in(&job.rhythm, self.tz)?;
        let repeats = match (rhythm.repeats, job.repeat_limit()) {
            (Some(embedded), Some(declared)) if embedded != declared => {
                return Err(SchedulerError::ConflictingRepeats {
                    rhythm: embedded,
                    job: declared,
                });
            }
            (embedded, declared) => declared.or(embedded),
        };
        Ok((rhythm.schedule, repeats))
    }

    /// Turn a stored job into an entry and hand it to the loop.
    async fn schedule(&self, mut job: Job) -> Result<(), SchedulerError> {
        let (schedule, repeats) = self.compile(&job)?;

        let partition = self.organizer.partition_of(&job.name);
        if !self.organizer.partitioner().check_partition_leader(partition) {
            return Err(SchedulerError::PartitionNotOwned(partition));
        }

        let counter = repeats.map(|limit| {
            self.counters.new_counter(
                &self.organizer.counter_path(partition, &job.name),
                i64::from(limit),
                job.ttl(),
            )
        });
        job.repeats = repeats;

        debug!(job = %job.name, rhythm = %job.rhythm, partition, ?repeats, "Scheduling job");
        let lock_prefix = self.organizer.tick_lock_path(partition, &job.name);
        let entry = Entry::new(job, schedule, lock_prefix, counter);
        self.submit(Operation::Insert(entry)).await;
        Ok(())
    }

    async fn unschedule(&self, name: &str) {
        debug!(job = %name, "Unscheduling job");
        self.submit(Operation::Remove(name.to_string())).await;

        let partition = self.organizer.partition_of(name);
        let counter = self
            .counters
            .new_counter(&self.organizer.counter_path(partition, name), 0, None);
        if let Err(e) = counter.delete().await {
            (self.user_errors)(&Job::new(name, ""), &SchedulerError::Counter(e));
        }
    }
}

/// Registry callbacks feeding the loop.
pub(crate) struct CoreListener(pub(crate) Arc<Core>);

#[async_trait]
impl JobListener for CoreListener {
    async fn on_put(&self, job: Job) -> Result<(), ListenerError> {
        self.0.schedule(job).await.map_err(|e| Box::new(e) as ListenerError)
    }

    async fn on_delete(&self, name: &str) -> Result<(), ListenerError> {
        self.0.unschedule(name).await;
        Ok(())
    }
}

/// Pieces each trigger attempt needs, minus the cancellation token that
/// only exists once the engine starts.
pub(crate) struct Wiring {
    pub trigger: Arc<dyn Trigger>,
    pub handlers: Handlers,
    pub hook: Option<RequestHook>,
    pub mutexes: MutexStore,
    pub local: Mutexer,
    pub collector: Collector,
    pub acquire_timeout: Duration,
}

/// Partition-aware cron engine.
///
/// Jobs are persisted through a [`JobStore`]; the store reports back every
/// job in a partition this host owns, and the engine fires each occurrence
/// at most once across every engine sharing the coordination store.
///
/// # Example
///
/// ```no_run
/// use cron_scheduler::{Cron, TriggerRequest};
/// use cron_types::{Job, TriggerResult};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> Result<(), cron_scheduler::SchedulerError> {
/// let cron = Cron::builder()
///     .trigger(|req: TriggerRequest| async move {
///         println!("{} fired at {}", req.job_name, req.scheduled_at);
///         Ok::<_, anyhow::Error>(TriggerResult::Ok)
///     })
///     .build()?;
///
/// let cancel = CancellationToken::new();
/// cron.start(cancel.clone()).await?;
/// cron.add_job(Job::new("report", "0 */5 * * * *")).await?;
///
/// cancel.cancel();
/// cron.wait().await;
/// # Ok(())
/// # }
/// ```
pub struct Cron {
    core: Arc<Core>,
    store: Arc<dyn JobStore>,
    wiring: Wiring,
    tasks: TaskTracker,
}

impl Cron {
    pub fn builder() -> CronBuilder {
        CronBuilder::new()
    }

    pub(crate) fn assemble(core: Arc<Core>, store: Arc<dyn JobStore>, wiring: Wiring) -> Self {
        Self {
            core,
            store,
            wiring,
            tasks: TaskTracker::new(),
        }
    }

    /// Persist a job. It is scheduled by whichever engine owns its
    /// partition.
    ///
    /// # Errors
    ///
    /// Returns a configuration error, without persisting anything, if the
    /// job is malformed, its rhythm does not parse, or its repeat count
    /// conflicts with the rhythm's.
    pub async fn add_job(&self, job: Job) -> Result<(), SchedulerError> {
        job.validate()?;
        self.core.compile(&job)?;
        self.store.put(&job).await.map_err(SchedulerError::from_store)
    }

    /// Remove a job. Removing a job that does not exist is not an error.
    pub async fn delete_job(&self, name: &str) -> Result<(), SchedulerError> {
        self.store
            .delete(name)
            .await
            .map_err(SchedulerError::from_store)
    }

    /// Job currently scheduled on this engine.
    pub async fn get_job(&self, name: &str) -> Option<Job> {
        self.entries()
            .await
            .into_iter()
            .find(|entry| entry.name() == name)
            .map(|entry| entry.job().clone())
    }

    /// Point-in-time copy of every scheduled entry ordered by next fire
    /// time. Empty unless the engine is running.
    pub async fn entries(&self) -> Vec<Entry> {
        let (tx, rx) = oneshot::channel();
        self.core.submit(Operation::Snapshot(tx)).await;
        rx.await.unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.core.phase() == Phase::Running
    }

    /// Replay the registry and start the loop.
    ///
    /// Cancelling `cancel` stops the loop, the session collector and the
    /// registry's streaming. Triggers already running are not waited for.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AlreadyRunning` on a second call, or the
    /// registry's error if the replay fails.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), SchedulerError> {
        let rx = locked(&self.core.live_rx)
            .take()
            .ok_or(SchedulerError::AlreadyRunning)?;

        if let Err(e) = self.store.start(cancel.clone()).await {
            self.core.stop();
            self.tasks.close();
            return Err(SchedulerError::from_store(e));
        }

        self.tasks
            .spawn(self.wiring.collector.clone().run(cancel.clone()));

        let pending = self.core.go_live();
        let dispatcher = Dispatcher {
            trigger: self.wiring.trigger.clone(),
            store: self.store.clone(),
            mutexes: self.wiring.mutexes.clone(),
            local: self.wiring.local.clone(),
            handlers: self.wiring.handlers.clone(),
            hook: self.wiring.hook.clone(),
            acquire_timeout: self.wiring.acquire_timeout,
            cancel: cancel.clone(),
        };
        self.tasks
            .spawn(run_loop(self.core.clone(), rx, dispatcher, pending, cancel));
        self.tasks.close();

        info!(namespace = %self.core.organizer.namespace(), "Scheduler started");
        Ok(())
    }

    /// Wait for the loop, the collector and the registry to shut down.
    pub async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.store.wait().await;
        debug!("Scheduler shutdown complete");
    }
}

/// The single writer of the entry table.
async fn run_loop(
    core: Arc<Core>,
    mut rx: mpsc::Receiver<Operation>,
    dispatcher: Dispatcher,
    pending: Vec<Operation>,
    cancel: CancellationToken,
) {
    let mut table = EntryTable::default();
    let now = core.clock.now();
    for op in pending {
        table.apply(op, now);
    }
    info!(entries = table.len(), "Scheduler loop running");

    loop {
        let effective = table.earliest();
        let wake = effective.map(|at| tokio::time::sleep(until(core.clock.now(), at)));
        let wake = async move {
            match wake {
                Some(sleep) => sleep.await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            op = rx.recv() => match op {
                Some(op) => table.apply(op, core.clock.now()),
                None => break,
            },
            _ = wake => {
                if let Some(at) = effective {
                    let due = table.advance_due(at);
                    debug!(at = %at, due = due.len(), "Firing");
                    for entry in due {
                        dispatcher.dispatch(entry, at);
                    }
                }
            }
        }
    }

    core.stop();
    info!("Scheduler loop stopped");
}

fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or_default()
}
