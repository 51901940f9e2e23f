use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::layout::StorageLayout;
use crate::machine::{Backoff, PipelinePolicy, RetryPolicy};
use crate::render::RenderConfig;
use crate::worker::WorkerConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("pressline.db")
}

/// Where workspaces, artifacts and job logs live.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("storage")
}

impl StorageConfig {
    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.root)
    }
}

/// Retry and retention settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Attempts per stage before a job fails permanently
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before a failed stage is retried (seconds)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Upper bound for exponential backoff (seconds)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default)]
    pub backoff: Backoff,

    /// How long a published artifact is kept locally (hours)
    #[serde(default = "default_artifact_ttl_hours")]
    pub artifact_ttl_hours: u64,

    /// Consecutive lease expiries before a job is failed
    #[serde(default = "default_stale_reclaim_limit")]
    pub stale_reclaim_limit: u32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    300
}

fn default_max_backoff() -> u64 {
    3600
}

fn default_artifact_ttl_hours() -> u64 {
    48
}

fn default_stale_reclaim_limit() -> u32 {
    3
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff(),
            max_backoff_secs: default_max_backoff(),
            backoff: Backoff::default(),
            artifact_ttl_hours: default_artifact_ttl_hours(),
            stale_reclaim_limit: default_stale_reclaim_limit(),
        }
    }
}

impl PipelineConfig {
    /// The policy the job store applies to outcomes.
    pub fn policy(&self) -> PipelinePolicy {
        let base = Duration::from_secs(self.retry_backoff_secs);
        let retry = RetryPolicy {
            backoff: self.backoff,
            base,
            max: Duration::from_secs(self.max_backoff_secs).max(base),
        };
        PipelinePolicy::default()
            .with_retry(retry)
            .with_max_attempts(self.max_attempts)
            .with_artifact_ttl(Duration::from_secs(
                self.artifact_ttl_hours.saturating_mul(3600),
            ))
            .with_stale_reclaim_limit(self.stale_reclaim_limit)
    }
}

/// TTL reaper configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReaperConfig {
    /// Time between sweeps (seconds)
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,
    /// Heartbeat rows not updated for this long are deleted on each sweep
    #[serde(default = "default_heartbeat_retention")]
    pub heartbeat_retention_secs: u64,
}

fn default_reaper_interval() -> u64 {
    600
}

fn default_heartbeat_retention() -> u64 {
    86400
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval(),
            heartbeat_retention_secs: default_heartbeat_retention(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn heartbeat_retention(&self) -> Duration {
        Duration::from_secs(self.heartbeat_retention_secs)
    }

    pub fn with_heartbeat_retention(mut self, retention: Duration) -> Self {
        self.heartbeat_retention_secs = retention.as_secs();
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}
