//! Background lease renewal for the job a worker is executing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::types::Role;
use crate::heartbeat::{HeartbeatRegistry, WorkerHeartbeat, WorkerState};
use crate::job::{JobError, JobId, JobStore};

/// Extends a job's lease on a fixed interval until dropped.
///
/// Once the store reports that the lease belongs to someone else, the keeper
/// stops and [`lost`](Self::lost) resolves so the caller can abandon the job.
pub struct LeaseKeeper {
    task: JoinHandle<()>,
    lost_rx: watch::Receiver<bool>,
}

impl LeaseKeeper {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        store: Arc<dyn JobStore>,
        heartbeats: Arc<dyn HeartbeatRegistry>,
        job_id: JobId,
        worker_id: String,
        role: Role,
        lease: Duration,
        interval: Duration,
    ) -> Self {
        let (lost_tx, lost_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match store.heartbeat(job_id, &worker_id, lease) {
                    Ok(expires_at) => {
                        debug!(
                            job_id,
                            "Worker {} extended lease of job {} until {}",
                            worker_id,
                            job_id,
                            expires_at
                        );
                        let hb = WorkerHeartbeat::now(
                            &worker_id,
                            role,
                            WorkerState::Busy,
                            Some(job_id),
                        );
                        if let Err(e) = heartbeats.record(&hb) {
                            debug!("Failed to record heartbeat of {}: {}", worker_id, e);
                        }
                    }
                    Err(JobError::LeaseLost { .. }) | Err(JobError::NotFound(_)) => {
                        warn!(
                            job_id,
                            "Worker {} lost the lease on job {}", worker_id, job_id
                        );
                        let _ = lost_tx.send(true);
                        return;
                    }
                    Err(e) => {
                        warn!(
                            job_id,
                            "Lease extension of job {} failed, will retry: {}", job_id, e
                        );
                    }
                }
            }
        });

        Self { task, lost_rx }
    }

    /// Resolves once the lease is known to be lost. Never resolves otherwise.
    pub async fn lost(&mut self) {
        if self.lost_rx.wait_for(|lost| *lost).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_lost(&self) -> bool {
        *self.lost_rx.borrow()
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.task.abort();
    }
}
