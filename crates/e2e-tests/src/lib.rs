//! End-to-end test infrastructure for shard-cron.
//!
//! Provides a [`TestFleet`]: several engines sharing one coordination
//! store, each driven by a [`TokioClock`] anchored at the Unix epoch so
//! tests can run under tokio's paused clock and reason in whole seconds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cron_coordination::{MemoryKv, NoPartitioning, Partitioner};
use cron_scheduler::{Cron, SchedulerError, TokioClock, TriggerRequest};
use cron_types::{Job, PartitionSettings, Settings, TriggerResult};

/// Namespace every fleet engine writes under.
pub const NAMESPACE: &str = "e2e";

/// Filter built from the settings' `log_level`.
pub fn log_filter(settings: &Settings) -> EnvFilter {
    EnvFilter::new(&settings.log_level)
}

/// Install a test subscriber once. `RUST_LOG` overrides the fleet's
/// `log_level`.
pub fn init_test_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter(&fleet_settings()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Instant `secs` seconds after the Unix epoch.
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).expect("timestamp in range")
}

/// One trigger invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired {
    pub host: usize,
    pub job: String,
    pub at: DateTime<Utc>,
    pub payload: Bytes,
}

/// Shared log of trigger invocations and reported errors.
#[derive(Default)]
pub struct Recorder {
    fired: Mutex<Vec<Fired>>,
    errors: Mutex<Vec<String>>,
    results: Mutex<HashMap<String, TriggerResult>>,
}

impl Recorder {
    /// Make every trigger of `job` return `result` instead of `Ok`.
    pub fn respond(&self, job: &str, result: TriggerResult) {
        self.results.lock().unwrap().insert(job.to_string(), result);
    }

    pub fn fired(&self) -> Vec<Fired> {
        self.fired.lock().unwrap().clone()
    }

    pub fn fired_for(&self, job: &str) -> Vec<Fired> {
        self.fired().into_iter().filter(|f| f.job == job).collect()
    }

    /// Occurrence seconds fired for `job`, in firing order.
    pub fn seconds_for(&self, job: &str) -> Vec<i64> {
        self.fired_for(job).iter().map(|f| f.at.timestamp()).collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    fn record(&self, host: usize, req: &TriggerRequest) -> TriggerResult {
        self.fired.lock().unwrap().push(Fired {
            host,
            job: req.job_name.clone(),
            at: req.scheduled_at,
            payload: req.payload.clone(),
        });
        self.results
            .lock()
            .unwrap()
            .get(&req.job_name)
            .copied()
            .unwrap_or(TriggerResult::Ok)
    }
}

/// Engines sharing one [`MemoryKv`].
pub struct TestFleet {
    pub kv: MemoryKv,
    pub recorder: Arc<Recorder>,
    engines: Vec<Cron>,
    cancel: CancellationToken,
}

impl TestFleet {
    /// `hosts` engines splitting `partitions` partitions between them.
    pub fn partitioned(hosts: u32, partitions: u32) -> Self {
        Self::build(hosts, |host| {
            let mut settings = fleet_settings();
            settings.partitioning = PartitionSettings {
                num_partitions: partitions,
                num_hosts: hosts,
                host_id: host,
            };
            (settings, None)
        })
    }

    /// `hosts` engines that all claim every job, so only the occurrence
    /// locks keep them from firing twice.
    pub fn overlapping(hosts: u32) -> Self {
        Self::build(hosts, |_| {
            let partitioner: Arc<dyn Partitioner> = Arc::new(NoPartitioning);
            (fleet_settings(), Some(partitioner))
        })
    }

    /// A single engine owning everything.
    pub fn single() -> Self {
        Self::partitioned(1, 1)
    }

    fn build(
        hosts: u32,
        configure: impl Fn(u32) -> (Settings, Option<Arc<dyn Partitioner>>),
    ) -> Self {
        let kv = MemoryKv::new();
        let recorder = Arc::new(Recorder::default());
        let engines = (0..hosts)
            .map(|host| {
                let (settings, partitioner) = configure(host);
                let mut builder = Cron::builder()
                    .settings(settings)
                    .kv(kv.clone())
                    .clock(Arc::new(TokioClock::starting_at(DateTime::<Utc>::UNIX_EPOCH)))
                    .trigger(recording_trigger(host as usize, recorder.clone()))
                    .error_handler(recording_errors(recorder.clone()));
                if let Some(partitioner) = partitioner {
                    builder = builder.partitioning(partitioner);
                }
                builder.build().expect("fleet engine builds")
            })
            .collect();

        Self {
            kv,
            recorder,
            engines,
            cancel: CancellationToken::new(),
        }
    }

    pub fn engine(&self, host: usize) -> &Cron {
        &self.engines[host]
    }

    pub fn engines(&self) -> &[Cron] {
        &self.engines
    }

    pub async fn start(&self) {
        for engine in &self.engines {
            engine
                .start(self.cancel.clone())
                .await
                .expect("engine starts");
        }
        settle().await;
    }

    pub async fn add_job(&self, job: Job) -> Result<(), SchedulerError> {
        let result = self.engines[0].add_job(job).await;
        settle().await;
        result
    }

    pub async fn delete_job(&self, name: &str) -> Result<(), SchedulerError> {
        let result = self.engines[0].delete_job(name).await;
        settle().await;
        result
    }

    /// Names scheduled on `host`, sorted.
    pub async fn scheduled_on(&self, host: usize) -> Vec<String> {
        let mut names: Vec<String> = self.engines[host]
            .entries()
            .await
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Whether any key exists under `suffix` inside the namespace.
    pub fn has_key(&self, suffix: &str) -> bool {
        self.kv
            .range(&format!("{}/", NAMESPACE))
            .iter()
            .any(|kv| kv.key.ends_with(suffix))
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        for engine in &self.engines {
            engine.wait().await;
        }
    }
}

fn fleet_settings() -> Settings {
    Settings {
        namespace: NAMESPACE.to_string(),
        ..Settings::default()
    }
}

fn recording_trigger(
    host: usize,
    recorder: Arc<Recorder>,
) -> impl Fn(TriggerRequest) -> std::future::Ready<anyhow::Result<TriggerResult>> + Send + Sync + 'static
{
    move |req: TriggerRequest| std::future::ready(Ok(recorder.record(host, &req)))
}

fn recording_errors(recorder: Arc<Recorder>) -> cron_scheduler::ErrorHandler {
    Arc::new(move |job: &Job, err: &SchedulerError| {
        recorder
            .errors
            .lock()
            .unwrap()
            .push(format!("{}: {}", job.name, err));
    })
}

/// Let spawned tasks run without moving the paused clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
