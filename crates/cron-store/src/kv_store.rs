//! Job registry on top of [`MemoryKv`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use cron_coordination::{KvEvent, MemoryKv, Organizer, Watch, WatchEvent};
use cron_types::{Job, JobRecord};

use crate::{JobListener, JobStore, StoreError};

/// Registry storing one protobuf record per job under the job's partition.
///
/// `start` replays and watches only the partitions this host owns, so a
/// job written by any host is picked up by whichever host owns it.
pub struct KvJobStore {
    kv: MemoryKv,
    organizer: Organizer,
    listener: Arc<dyn JobListener>,
    tasks: TaskTracker,
    started: AtomicBool,
}

impl KvJobStore {
    pub fn new(kv: MemoryKv, organizer: Organizer, listener: Arc<dyn JobListener>) -> Self {
        Self {
            kv,
            organizer,
            listener,
            tasks: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Replay one partition. Returns the names delivered to the listener.
    async fn replay(&self, prefix: &str) -> Result<(HashSet<String>, Watch), StoreError> {
        let (records, watch) = self.kv.range_and_watch(prefix);
        let mut known = HashSet::with_capacity(records.len());
        for record in records {
            let job = JobRecord::decode_job(&record.value)?;
            let name = job.name.clone();
            self.listener
                .on_put(job)
                .await
                .map_err(|source| StoreError::Listener {
                    name: name.clone(),
                    source,
                })?;
            known.insert(name);
        }
        Ok((known, watch))
    }
}

#[async_trait]
impl JobStore for KvJobStore {
    #[instrument(skip_all, fields(namespace = %self.organizer.namespace()))]
    async fn start(&self, cancel: CancellationToken) -> Result<(), StoreError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StoreError::AlreadyStarted);
        }

        // Partitions already streaming are stopped if a later replay fails.
        let streams = cancel.child_token();
        for partition in self.organizer.partitioner().list_partitions() {
            let prefix = format!("{}/", self.organizer.jobs_path(partition));
            let (known, watch) = match self.replay(&prefix).await {
                Ok(replayed) => replayed,
                Err(e) => {
                    streams.cancel();
                    self.tasks.close();
                    return Err(e);
                }
            };
            info!(partition, jobs = known.len(), "Partition replayed");

            let sync = PartitionSync {
                kv: self.kv.clone(),
                prefix,
                listener: self.listener.clone(),
                known,
            };
            self.tasks.spawn(sync.run(watch, streams.clone()));
        }
        self.tasks.close();
        Ok(())
    }

    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        job.validate()?;
        let key = self.organizer.job_path(&job.name);
        let revision = self.kv.put(&key, JobRecord::encode_job(job), job.ttl());
        debug!(job = %job.name, key = %key, revision, "Job stored");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let key = self.organizer.job_path(name);
        if self.kv.delete(&key) {
            debug!(job = %name, key = %key, "Job removed");
        }
        Ok(())
    }

    async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Streams one partition's changes to the listener.
struct PartitionSync {
    kv: MemoryKv,
    prefix: String,
    listener: Arc<dyn JobListener>,
    known: HashSet<String>,
}

impl PartitionSync {
    async fn run(mut self, mut watch: Watch, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = watch.next() => event,
            };

            match event {
                Ok(WatchEvent::Event(KvEvent::Put(record))) => {
                    match JobRecord::decode_job(&record.value) {
                        Ok(job) => self.put(job).await,
                        Err(e) => warn!(key = %record.key, error = %e, "Skipping corrupt job record"),
                    }
                }
                Ok(WatchEvent::Event(KvEvent::Delete { key, .. })) => {
                    if let Some(name) = Organizer::job_name_from_key(&key) {
                        let name = name.to_string();
                        self.delete(&name).await;
                    }
                }
                Ok(WatchEvent::Lagged(missed)) => {
                    warn!(prefix = %self.prefix, missed, "Job watch lagged, resyncing");
                    watch = self.resync().await;
                }
                Err(e) => {
                    warn!(prefix = %self.prefix, error = %e, "Job watch ended");
                    break;
                }
            }
        }
        debug!(prefix = %self.prefix, "Partition sync stopped");
    }

    async fn put(&mut self, job: Job) {
        let name = job.name.clone();
        self.known.insert(name.clone());
        if let Err(e) = self.listener.on_put(job).await {
            warn!(job = %name, error = %e, "Listener rejected job");
        }
    }

    async fn delete(&mut self, name: &str) {
        self.known.remove(name);
        if let Err(e) = self.listener.on_delete(name).await {
            warn!(job = %name, error = %e, "Listener failed to remove job");
        }
    }

    /// Rebuild listener state from a fresh snapshot after missed events.
    async fn resync(&mut self) -> Watch {
        let (records, watch) = self.kv.range_and_watch(&self.prefix);
        let mut jobs = Vec::with_capacity(records.len());
        for record in records {
            match JobRecord::decode_job(&record.value) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(key = %record.key, error = %e, "Skipping corrupt job record"),
            }
        }

        let live: HashSet<String> = jobs.iter().map(|j| j.name.clone()).collect();
        let vanished: Vec<String> = self.known.difference(&live).cloned().collect();
        for name in vanished {
            self.delete(&name).await;
        }
        for job in jobs {
            self.put(job).await;
        }
        watch
    }
}
