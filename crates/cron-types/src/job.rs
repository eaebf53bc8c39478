//! Job definition and trigger outcome types.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CronError;

/// A named, recurring unit of work.
///
/// Identity is the name: putting a job whose name already exists replaces
/// the previous definition. The name becomes the last segment of the job's
/// storage key, so it must be non-empty and must not contain `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job name
    pub name: String,

    /// Rhythm expression (cron, `@every`, or ISO-8601 repeating interval)
    pub rhythm: String,

    /// Phase anchor; the job is not eligible before this instant.
    /// `None` anchors at the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Maximum number of successful triggers. `None` or zero means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeats: Option<u32>,

    /// Lifetime of the persisted definition in whole seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,

    /// Opaque caller metadata handed to the trigger
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Opaque caller payload handed to the trigger
    #[serde(default)]
    pub payload: Bytes,
}

impl Job {
    pub fn new(name: impl Into<String>, rhythm: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rhythm: rhythm.into(),
            start_time: None,
            repeats: None,
            ttl_secs: None,
            metadata: HashMap::new(),
            payload: Bytes::new(),
        }
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn with_repeats(mut self, repeats: u32) -> Self {
        self.repeats = Some(repeats);
        self
    }

    /// Bind the persisted definition to a lease. Sub-second parts are dropped.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Repeat bound, with zero normalized to "unbounded".
    pub fn repeat_limit(&self) -> Option<u32> {
        self.repeats.filter(|r| *r > 0)
    }

    /// Lease duration, with zero normalized to "no lease".
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    /// Check the fields that must hold before a job is persisted.
    pub fn validate(&self) -> Result<(), CronError> {
        if self.name.is_empty() {
            return Err(CronError::InvalidJob("name must not be empty".to_string()));
        }
        if self.name.contains('/') {
            return Err(CronError::InvalidJob(format!(
                "name '{}' must not contain '/'",
                self.name
            )));
        }
        if self.rhythm.trim().is_empty() {
            return Err(CronError::InvalidJob(format!(
                "job '{}' has an empty rhythm",
                self.name
            )));
        }
        Ok(())
    }
}

/// Outcome reported by a trigger callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerResult {
    /// Work done; counts against the repeat bound
    Ok,
    /// Work failed; reported to the error handler, not retried
    Failure,
    /// Job asked to be removed
    Delete,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_fields() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let job = Job::new("nightly", "@daily")
            .with_start_time(start)
            .with_repeats(5)
            .with_ttl(Duration::from_millis(10_500))
            .with_metadata("team", "ops")
            .with_payload(&b"hello"[..]);

        assert_eq!(job.start_time, Some(start));
        assert_eq!(job.repeat_limit(), Some(5));
        assert_eq!(job.ttl(), Some(Duration::from_secs(10)));
        assert_eq!(job.metadata.get("team").map(String::as_str), Some("ops"));
        assert_eq!(job.payload.as_ref(), b"hello");
    }

    #[test]
    fn test_zero_bounds_are_unbounded() {
        let job = Job::new("a", "@every 1s").with_repeats(0).with_ttl(Duration::ZERO);
        assert_eq!(job.repeat_limit(), None);
        assert_eq!(job.ttl(), None);
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(Job::new("", "@hourly").validate().is_err());
        assert!(Job::new("a/b", "@hourly").validate().is_err());
        assert!(Job::new("a", "  ").validate().is_err());
        assert!(Job::new("a", "@hourly").validate().is_ok());
    }

    #[test]
    fn test_trigger_result_serialization() {
        let json = serde_json::to_string(&TriggerResult::Delete).unwrap();
        assert_eq!(json, "\"delete\"");
    }
}
