//! Worker loop configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Polling, lease and heartbeat timing for one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// How long to sleep when no job was claimable (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Lease granted on claim and on every heartbeat.
    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    /// How often a busy worker extends its lease and reports liveness.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Workers not seen for this long are shown as dead.
    #[serde(default = "default_liveness_window")]
    pub liveness_window_secs: u64,

    /// How long a job in progress may keep running after shutdown is
    /// requested before it is interrupted and handed back to the queue.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_lease() -> u64 {
    600
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_liveness_window() -> u64 {
    180
}

fn default_shutdown_grace() -> u64 {
    30
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            lease_secs: default_lease(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            liveness_window_secs: default_liveness_window(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
