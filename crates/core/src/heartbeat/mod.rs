//! Worker liveness bookkeeping.
//!
//! Heartbeats are informational: lease expiry alone governs recovery from
//! dead workers.

mod sqlite;

pub use sqlite::SqliteHeartbeatRegistry;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobError, JobId};
use crate::worker::Role;

/// What a worker was doing when it last reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Stopping,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerState::Idle),
            "busy" => Ok(WorkerState::Busy),
            "stopping" => Ok(WorkerState::Stopping),
            other => Err(format!("unknown worker state '{}'", other)),
        }
    }
}

/// One worker's most recent report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub role: Role,
    pub state: WorkerState,
    /// Job being worked on while busy.
    pub job_id: Option<JobId>,
    pub pid: u32,
    pub hostname: String,
    pub last_seen: DateTime<Utc>,
}

impl WorkerHeartbeat {
    /// A heartbeat for this process, stamped now.
    pub fn now(worker_id: &str, role: Role, state: WorkerState, job_id: Option<JobId>) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.to_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            worker_id: worker_id.to_string(),
            role,
            state,
            job_id,
            pid: std::process::id(),
            hostname,
            last_seen: Utc::now(),
        }
    }

    /// Whether the worker reported within `window` of `now`.
    pub fn is_alive(&self, now: DateTime<Utc>, window: std::time::Duration) -> bool {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.last_seen) <= window
    }
}

/// Injectable registry of worker heartbeats.
pub trait HeartbeatRegistry: Send + Sync {
    /// Upsert the worker's row. Older reports never overwrite newer ones.
    fn record(&self, heartbeat: &WorkerHeartbeat) -> Result<(), JobError>;

    /// All known workers, most recently seen first.
    fn list(&self) -> Result<Vec<WorkerHeartbeat>, JobError>;

    /// Forget workers not seen since `cutoff`. Returns how many were removed.
    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_heartbeat_liveness_window() {
        let mut hb = WorkerHeartbeat::now("qa:1", Role::Qa, WorkerState::Idle, None);
        assert_eq!(hb.pid, std::process::id());
        assert!(!hb.hostname.is_empty());

        let now = Utc::now();
        assert!(hb.is_alive(now, Duration::from_secs(180)));

        hb.last_seen = now - chrono::Duration::seconds(600);
        assert!(!hb.is_alive(now, Duration::from_secs(180)));
    }
}
