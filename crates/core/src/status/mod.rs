//! Read-only operator view over jobs, logs and workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::heartbeat::{HeartbeatRegistry, WorkerHeartbeat};
use crate::job::{Job, JobError, JobFilter, JobId, JobStatus, JobStore, Stage};
use crate::joblog::JobLogs;
use crate::machine::Phase;

/// Lines of `job.log` included per job.
pub const LOG_TAIL_LINES: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct PhaseCount {
    pub stage: Stage,
    pub status: JobStatus,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub release: String,
    pub title: String,
    /// `stage:step`, e.g. `render:running`.
    pub phase: String,
    pub status: JobStatus,
    pub attempts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub log_tail: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    #[serde(flatten)]
    pub heartbeat: WorkerHeartbeat,
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    /// Non-zero counts only.
    pub counts: Vec<PhaseCount>,
    pub jobs: Vec<JobSummary>,
    pub workers: Vec<WorkerStatus>,
}

pub struct StatusReader {
    store: Arc<dyn JobStore>,
    heartbeats: Arc<dyn HeartbeatRegistry>,
    logs: JobLogs,
    liveness_window: Duration,
}

const STATUSES: [JobStatus; 6] = [
    JobStatus::Pending,
    JobStatus::Claimed,
    JobStatus::Running,
    JobStatus::Retrying,
    JobStatus::FailedPermanent,
    JobStatus::Done,
];

impl StatusReader {
    pub fn new(
        store: Arc<dyn JobStore>,
        heartbeats: Arc<dyn HeartbeatRegistry>,
        logs: JobLogs,
        liveness_window: Duration,
    ) -> Self {
        Self {
            store,
            heartbeats,
            logs,
            liveness_window,
        }
    }

    async fn summarize(&self, job: &Job) -> JobSummary {
        let log_tail = match self.logs.tail(job.id, LOG_TAIL_LINES).await {
            Ok(lines) => lines,
            Err(e) => {
                debug!("Cannot read log of job {}: {}", job.id, e);
                Vec::new()
            }
        };

        JobSummary {
            id: job.id,
            release: job.label(),
            title: job.metadata.title.clone(),
            phase: Phase::of(job).to_string(),
            status: job.status,
            attempts: format!("{}/{}", job.attempt_count, job.max_attempts),
            owner: job.owner.clone(),
            lease_expires_at: job.lease_expires_at,
            upload_url: job.upload_url.clone(),
            ttl_expires_at: job.ttl_expires_at,
            error: job.error_message.clone(),
            log_tail,
        }
    }

    /// The `limit` oldest jobs plus global counts and worker liveness.
    pub async fn snapshot(&self, limit: i64) -> Result<StatusSnapshot, JobError> {
        let now = Utc::now();

        let mut counts = Vec::new();
        for stage in Stage::ALL {
            for status in STATUSES {
                let filter = JobFilter::new().with_stage(stage).with_status(status);
                let count = self.store.count(&filter)?;
                if count > 0 {
                    counts.push(PhaseCount {
                        stage,
                        status,
                        count,
                    });
                }
            }
        }

        let jobs = self.store.list(&JobFilter::new().with_limit(limit))?;
        let mut summaries = Vec::with_capacity(jobs.len());
        for job in &jobs {
            summaries.push(self.summarize(job).await);
        }

        let workers = self
            .heartbeats
            .list()?
            .into_iter()
            .map(|heartbeat| WorkerStatus {
                alive: heartbeat.is_alive(now, self.liveness_window),
                heartbeat,
            })
            .collect();

        Ok(StatusSnapshot {
            generated_at: now,
            counts,
            jobs: summaries,
            workers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::{SqliteHeartbeatRegistry, WorkerState};
    use crate::job::{EnqueueRequest, ReleaseMetadata, SqliteJobStore};
    use crate::layout::StorageLayout;
    use crate::worker::Role;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot() {
        let dir = TempDir::new().unwrap();
        let logs = JobLogs::new(StorageLayout::new(dir.path()));
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let heartbeats = Arc::new(SqliteHeartbeatRegistry::in_memory().unwrap());

        let job = store
            .enqueue(EnqueueRequest::new("c1", "r1", ReleaseMetadata::new("Night Drive")))
            .unwrap();
        store
            .enqueue(EnqueueRequest::new("c1", "r2", ReleaseMetadata::new("Day Trip")))
            .unwrap();
        logs.append(job.id, "hello").await.unwrap();

        let live = WorkerHeartbeat::now("import:a", Role::Import, WorkerState::Idle, None);
        let mut dead = WorkerHeartbeat::now("render:b", Role::Render, WorkerState::Busy, Some(9));
        dead.last_seen = Utc::now() - chrono::Duration::seconds(3600);
        heartbeats.record(&live).unwrap();
        heartbeats.record(&dead).unwrap();

        let reader = StatusReader::new(
            store,
            heartbeats,
            logs,
            Duration::from_secs(180),
        );
        let snapshot = reader.snapshot(1).await.unwrap();

        assert_eq!(snapshot.counts.len(), 1);
        assert_eq!(snapshot.counts[0].stage, Stage::Import);
        assert_eq!(snapshot.counts[0].count, 2);

        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].phase, "import:pending");
        assert_eq!(snapshot.jobs[0].title, "Night Drive");
        assert!(snapshot.jobs[0].log_tail[0].ends_with("| hello"));

        let alive: Vec<_> = snapshot
            .workers
            .iter()
            .map(|w| (w.heartbeat.worker_id.as_str(), w.alive))
            .collect();
        assert!(alive.contains(&("import:a", true)));
        assert!(alive.contains(&("render:b", false)));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["jobs"][0]["status"], "pending");
        assert_eq!(json["workers"][0]["alive"], true);
    }
}
