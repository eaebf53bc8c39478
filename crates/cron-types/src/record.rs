//! Persisted job record.
//!
//! Jobs are stored as protobuf-encoded [`JobRecord`]s. A record missing its
//! name or rhythm is treated as corrupt on read.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::DateTime;
use prost::Message;

use crate::error::CronError;
use crate::job::Job;

/// Wire form of a [`Job`].
#[derive(Clone, PartialEq, Message)]
pub struct JobRecord {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub rhythm: String,
    #[prost(map = "string, string", tag = "3")]
    pub metadata: HashMap<String, String>,
    #[prost(bytes = "bytes", tag = "4")]
    pub payload: Bytes,
    #[prost(int64, optional, tag = "5")]
    pub start_time_unix_ms: Option<i64>,
    #[prost(uint32, tag = "6")]
    pub repeats: u32,
    #[prost(uint64, tag = "7")]
    pub ttl_seconds: u64,
}

impl JobRecord {
    /// Encode a job into its persisted bytes.
    pub fn encode_job(job: &Job) -> Vec<u8> {
        JobRecord::from(job).encode_to_vec()
    }

    /// Decode persisted bytes, rejecting records with an empty name or rhythm.
    pub fn decode_job(buf: &[u8]) -> Result<Job, CronError> {
        let record = JobRecord::decode(buf)?;
        Job::try_from(record)
    }
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            name: job.name.clone(),
            rhythm: job.rhythm.clone(),
            metadata: job.metadata.clone(),
            payload: job.payload.clone(),
            start_time_unix_ms: job.start_time.map(|t| t.timestamp_millis()),
            repeats: job.repeats.unwrap_or(0),
            ttl_seconds: job.ttl_secs.unwrap_or(0),
        }
    }
}

impl TryFrom<JobRecord> for Job {
    type Error = CronError;

    fn try_from(record: JobRecord) -> Result<Self, Self::Error> {
        if record.name.is_empty() {
            return Err(CronError::CorruptRecord("record has an empty name".to_string()));
        }
        if record.rhythm.is_empty() {
            return Err(CronError::CorruptRecord(format!(
                "record '{}' has an empty rhythm",
                record.name
            )));
        }

        let start_time = match record.start_time_unix_ms {
            Some(ms) => Some(DateTime::from_timestamp_millis(ms).ok_or_else(|| {
                CronError::CorruptRecord(format!(
                    "record '{}' has an out-of-range start time {}",
                    record.name, ms
                ))
            })?),
            None => None,
        };

        Ok(Job {
            name: record.name,
            rhythm: record.rhythm,
            start_time,
            repeats: (record.repeats > 0).then_some(record.repeats),
            ttl_secs: (record.ttl_seconds > 0).then_some(record.ttl_seconds),
            metadata: record.metadata,
            payload: record.payload,
        })
    }
}
