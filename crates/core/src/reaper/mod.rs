//! Periodic purge of local artifacts whose retention has expired.
//!
//! The reaper is a cleanup worker on a timer: expired jobs are claimed
//! through the normal lease protocol, so several reapers can run side by
//! side and a crashed sweep is picked up by the next one. Each sweep also
//! forgets workers whose heartbeats are older than the retention window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::ReaperConfig;
use crate::heartbeat::HeartbeatRegistry;
use crate::job::{JobStatus, JobStore};
use crate::joblog::JobLogs;
use crate::worker::{
    CleanupHandler, HandlerTable, Processed, Role, RoleHandler, WorkerConfig, WorkerError,
    WorkerLoop,
};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Jobs whose files were deleted and recorded as purged.
    pub purged: usize,
    /// Cleanup attempts that failed and were scheduled for retry (or gave up).
    pub failed: usize,
    /// Jobs taken over by another reaper mid-sweep.
    pub lost: usize,
    /// Stale worker heartbeat rows deleted.
    pub pruned_workers: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.purged == 0 && self.failed == 0 && self.lost == 0 && self.pruned_workers == 0
    }
}

pub struct TtlReaper {
    config: ReaperConfig,
    worker: WorkerLoop,
    heartbeats: Arc<dyn HeartbeatRegistry>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl TtlReaper {
    pub fn new(
        config: ReaperConfig,
        worker_config: WorkerConfig,
        store: Arc<dyn JobStore>,
        heartbeats: Arc<dyn HeartbeatRegistry>,
        logs: JobLogs,
    ) -> Result<Self, WorkerError> {
        let handlers = HandlerTable::new().with(RoleHandler::Cleanup(CleanupHandler::new(
            store.clone(),
            logs.clone(),
        )));
        let worker = WorkerLoop::new(
            Role::Cleanup,
            worker_config,
            store,
            heartbeats.clone(),
            &handlers,
            logs,
        )?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            worker,
            heartbeats,
            running: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn worker_id(&self) -> &str {
        self.worker.worker_id()
    }

    /// Purges every job whose TTL has expired, one claim at a time.
    pub async fn sweep(&self) -> Result<SweepReport, WorkerError> {
        let mut report = SweepReport::default();
        while let Some(processed) = self.worker.run_once().await? {
            match processed {
                Processed::Transitioned(job) if job.status == JobStatus::Done => {
                    report.purged += 1
                }
                Processed::Transitioned(job) => {
                    warn!(
                        job_id = job.id,
                        stage = %job.stage,
                        attempt = job.attempt_count,
                        "Cleanup of job {} failed: {}",
                        job.id,
                        job.error_message.as_deref().unwrap_or("unknown error")
                    );
                    report.failed += 1
                }
                Processed::LeaseLost(_) => report.lost += 1,
                Processed::Released(_) => break,
            }
        }
        report.pruned_workers = self.prune_heartbeats();

        if report.is_empty() {
            debug!("Reaper {}: nothing expired", self.worker_id());
        } else {
            info!(
                "Reaper {} swept: {} purged, {} failed, {} lost, {} workers forgotten",
                self.worker_id(),
                report.purged,
                report.failed,
                report.lost,
                report.pruned_workers
            );
        }
        Ok(report)
    }

    fn prune_heartbeats(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.heartbeat_retention())
            .unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return 0;
        };
        match self.heartbeats.prune(cutoff) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Failed to prune worker heartbeats: {}", e);
                0
            }
        }
    }

    /// Sweeps every `interval_secs` until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Reaper already running");
            return;
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(
            "Reaper {} started (every {:?})",
            self.worker_id(),
            self.config.interval()
        );

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.sweep().await {
                error!("Reaper sweep failed: {}", e);
            }
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(self.config.interval()) => {}
            }
        }

        info!("Reaper {} stopped", self.worker_id());
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.worker.stop();
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::{SqliteHeartbeatRegistry, WorkerHeartbeat, WorkerState};
    use crate::job::{Actor, EnqueueRequest, Outcome, ReleaseMetadata, SqliteJobStore, StageOutput};
    use crate::layout::StorageLayout;
    use crate::machine::PipelinePolicy;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Walks a job to `cleanup:pending` by hand.
    fn publish(store: &SqliteJobStore, release: &str) -> i64 {
        let job = store
            .enqueue(EnqueueRequest::new("c1", release, ReleaseMetadata::new(release)))
            .unwrap();
        for role in [Role::Import, Role::Render, Role::Qa, Role::Upload] {
            let claimed = store
                .claim(role, "w", Duration::from_secs(60))
                .unwrap()
                .unwrap();
            store
                .transition(
                    claimed.id,
                    &Actor::worker("w"),
                    Outcome::Completed(StageOutput::empty()),
                )
                .unwrap();
        }
        store.approve(job.id, "ops").unwrap();
        store.mark_published(job.id, "ops").unwrap();
        job.id
    }

    #[tokio::test]
    async fn test_sweep_purges_only_expired() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        let store = Arc::new(
            SqliteJobStore::in_memory()
                .unwrap()
                .with_policy(PipelinePolicy::default().with_artifact_ttl(Duration::ZERO)),
        );
        let id = publish(&store, "r1");
        std::fs::create_dir_all(layout.outbox_dir(id)).unwrap();
        std::fs::write(layout.artifact_path(id), b"video").unwrap();

        let reaper = TtlReaper::new(
            ReaperConfig::default(),
            WorkerConfig::default(),
            store.clone(),
            Arc::new(SqliteHeartbeatRegistry::in_memory().unwrap()),
            JobLogs::new(layout.clone()),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.purged, 1);
        assert!(!layout.artifact_path(id).exists());

        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.artifact_purged_at.is_some());

        // Nothing left on a second pass.
        assert!(reaper.sweep().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skips_unexpired() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let id = publish(&store, "r1");

        let reaper = TtlReaper::new(
            ReaperConfig::default(),
            WorkerConfig::default(),
            store.clone(),
            Arc::new(SqliteHeartbeatRegistry::in_memory().unwrap()),
            JobLogs::new(StorageLayout::new(dir.path())),
        )
        .unwrap();

        assert!(reaper.sweep().await.unwrap().is_empty());
        assert!(store.get(id).unwrap().unwrap().artifact_purged_at.is_none());
    }

    #[tokio::test]
    async fn test_sweep_forgets_long_dead_workers() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let heartbeats = Arc::new(SqliteHeartbeatRegistry::in_memory().unwrap());

        // Five restarts of a render worker, each under a fresh id, long ago.
        for i in 0..5 {
            let mut hb = WorkerHeartbeat::now(
                &Role::Render.new_worker_id(),
                Role::Render,
                WorkerState::Stopping,
                None,
            );
            hb.last_seen = Utc::now() - chrono::Duration::hours(2 + i);
            heartbeats.record(&hb).unwrap();
        }
        let current = WorkerHeartbeat::now("render:live", Role::Render, WorkerState::Idle, None);
        heartbeats.record(&current).unwrap();

        let reaper = TtlReaper::new(
            ReaperConfig::default().with_heartbeat_retention(Duration::from_secs(3600)),
            WorkerConfig::default(),
            store,
            heartbeats.clone(),
            JobLogs::new(StorageLayout::new(dir.path())),
        )
        .unwrap();

        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.pruned_workers, 5);
        assert_eq!(report.purged, 0);

        let mut remaining: Vec<String> = heartbeats
            .list()
            .unwrap()
            .into_iter()
            .map(|hb| hb.worker_id)
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec![reaper.worker_id().to_string(), "render:live".to_string()]);

        assert_eq!(reaper.sweep().await.unwrap().pruned_workers, 0);
    }
}
