//! Configuration loading for shard-cron.
//!
//! Layered config: defaults -> config file -> explicit file -> env vars.
//! The default config file lives at ~/.config/shard-cron/config.toml.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::CronError;

/// Static partition assignment for this host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSettings {
    /// Total number of partitions the job namespace is split into
    #[serde(default = "default_num_partitions")]
    pub num_partitions: u32,

    /// Number of hosts sharing the partitions
    #[serde(default = "default_num_hosts")]
    pub num_hosts: u32,

    /// Zero-based id of this host
    #[serde(default)]
    pub host_id: u32,
}

fn default_num_partitions() -> u32 {
    1
}

fn default_num_hosts() -> u32 {
    1
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            num_partitions: default_num_partitions(),
            num_hosts: default_num_hosts(),
            host_id: 0,
        }
    }
}

/// Per-occurrence lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    /// Deadline for acquiring an occurrence lock (ms).
    /// Exceeding it abandons the attempt without reporting an error.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// Lease attached to an acquired lock. Locks are never released,
    /// so this bounds how long an occurrence stays claimed.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

fn default_acquire_timeout() -> u64 {
    1000
}

fn default_lease_ttl() -> u64 {
    60
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: default_acquire_timeout(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

impl LockSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

/// Idle-session eviction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSettings {
    /// Age after which a cached lock session is evicted
    #[serde(default = "default_collector_ttl")]
    pub ttl_secs: u64,

    /// Interval between eviction sweeps
    #[serde(default = "default_collector_period")]
    pub period_secs: u64,
}

fn default_collector_ttl() -> u64 {
    3600
}

fn default_collector_period() -> u64 {
    60
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_collector_ttl(),
            period_secs: default_collector_period(),
        }
    }
}

impl CollectorSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root of every key this engine reads or writes
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// IANA timezone cron rhythms are evaluated in
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub partitioning: PartitionSettings,

    #[serde(default)]
    pub lock: LockSettings,

    #[serde(default)]
    pub collector: CollectorSettings,
}

fn default_namespace() -> String {
    "shard_cron".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            timezone: default_timezone(),
            log_level: default_log_level(),
            partitioning: PartitionSettings::default(),
            lock: LockSettings::default(),
            collector: CollectorSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/shard-cron/config.toml)
    /// 3. Explicit config file (optional, must exist when given)
    /// 4. Environment variables (CRON_*, nested with `__`)
    pub fn load(config_path: Option<&str>) -> Result<Self, CronError> {
        let config_dir = ProjectDirs::from("", "", "shard-cron")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("namespace", default_namespace())
            .map_err(|e| CronError::Config(e.to_string()))?
            .set_default("timezone", default_timezone())
            .map_err(|e| CronError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| CronError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Format: CRON_NAMESPACE, CRON_LOCK__ACQUIRE_TIMEOUT_MS, ...
        builder = builder.add_source(
            Environment::with_prefix("CRON")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .map_err(|e| CronError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| CronError::Config(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse the configured timezone into a `chrono_tz::Tz`.
    pub fn parse_timezone(&self) -> Result<chrono_tz::Tz, CronError> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| CronError::Config(format!("invalid timezone: {}", self.timezone)))
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), CronError> {
        if self.namespace.is_empty() {
            return Err(CronError::Config("namespace must not be empty".to_string()));
        }
        let p = &self.partitioning;
        if p.num_partitions == 0 || p.num_hosts == 0 {
            return Err(CronError::Config(
                "num_partitions and num_hosts must be > 0".to_string(),
            ));
        }
        if p.host_id >= p.num_hosts {
            return Err(CronError::Config(format!(
                "host_id {} out of range for {} hosts",
                p.host_id, p.num_hosts
            )));
        }
        if self.lock.acquire_timeout_ms == 0 || self.lock.lease_ttl_secs == 0 {
            return Err(CronError::Config(
                "lock timeouts must be > 0".to_string(),
            ));
        }
        if self.collector.period_secs == 0 {
            return Err(CronError::Config("collector.period_secs must be > 0".to_string()));
        }
        self.parse_timezone()?;
        Ok(())
    }
}
