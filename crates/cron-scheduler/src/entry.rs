//! Scheduled entries.
//!
//! An [`Entry`] binds one job to its compiled schedule and tracks when it
//! fires next and when it last fired.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};

use cron_coordination::Counter;
use cron_rhythm::Schedule;
use cron_types::Job;

/// A job bound to its schedule.
///
/// `next == None` means the schedule is unsatisfiable; `prev == None` means
/// the entry has not fired yet.
#[derive(Clone)]
pub struct Entry {
    job: Arc<Job>,
    schedule: Arc<dyn Schedule>,
    next: Option<DateTime<Utc>>,
    prev: Option<DateTime<Utc>>,
    lock_prefix: String,
    counter: Option<Arc<dyn Counter>>,
}

impl Entry {
    pub fn new(
        job: Job,
        schedule: Arc<dyn Schedule>,
        lock_prefix: impl Into<String>,
        counter: Option<Arc<dyn Counter>>,
    ) -> Self {
        Self {
            job: Arc::new(job),
            schedule,
            next: None,
            prev: None,
            lock_prefix: lock_prefix.into(),
            counter,
        }
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn schedule(&self) -> &Arc<dyn Schedule> {
        &self.schedule
    }

    pub fn next(&self) -> Option<DateTime<Utc>> {
        self.next
    }

    pub fn prev(&self) -> Option<DateTime<Utc>> {
        self.prev
    }

    pub fn counter(&self) -> Option<&Arc<dyn Counter>> {
        self.counter.as_ref()
    }

    /// Lock name identifying the occurrence at `at` fleet-wide.
    pub fn lock_key(&self, at: DateTime<Utc>) -> String {
        format!("{}{}", self.lock_prefix, at.timestamp())
    }

    /// Phase anchor: the job's start truncated to whole seconds, or the
    /// Unix epoch.
    fn start(&self) -> DateTime<Utc> {
        self.job
            .start_time
            .map(|t| t.trunc_subsecs(0))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Advance to the first occurrence after `now`.
    ///
    /// A start still in the future is itself the next occurrence.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        self.prev = self.next;
        let start = self.start();
        self.next = if start > now {
            Some(start)
        } else {
            self.schedule.next(start, now)
        };
    }
}

/// Orders entries by `next` ascending, with unscheduled entries last.
pub fn by_next(a: &Entry, b: &Entry) -> Ordering {
    match (a.next, b.next) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.job.name)
            .field("rhythm", &self.job.rhythm)
            .field("next", &self.next)
            .field("prev", &self.prev)
            .field("lock_prefix", &self.lock_prefix)
            .field("counted", &self.counter.is_some())
            .finish()
    }
}
