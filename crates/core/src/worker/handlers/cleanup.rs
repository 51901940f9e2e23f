//! Deletes a published release's local files once its retention expires.

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::artifact_of;
use crate::job::{Job, JobStore, Outcome, StageOutput};
use crate::joblog::JobLogs;
use crate::render::growth_paths;
use crate::worker::handler::Handler;

/// Deletes the local artifact and workspace once the TTL has passed.
///
/// Every step tolerates files that are already gone, so a retried or
/// concurrently reclaimed cleanup converges on the same result.
pub struct CleanupHandler {
    store: Arc<dyn JobStore>,
    logs: JobLogs,
}

impl CleanupHandler {
    pub fn new(store: Arc<dyn JobStore>, logs: JobLogs) -> Self {
        Self { store, logs }
    }
}

async fn remove_file(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

async fn remove_dir(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

impl CleanupHandler {
    async fn purge(&self, job: &Job) -> io::Result<usize> {
        let layout = self.logs.layout();
        let mut removed = 0;
        for path in growth_paths(&artifact_of(job, layout)) {
            if remove_file(&path).await? {
                debug!("Removed {}", path.display());
                removed += 1;
            }
        }
        for dir in [layout.outbox_dir(job.id), layout.workspace_dir(job.id)] {
            if remove_dir(&dir).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl Handler for CleanupHandler {
    async fn execute(&self, job: &Job) -> Outcome {
        let removed = match self.purge(job).await {
            Ok(removed) => removed,
            Err(e) => return Outcome::retryable(format!("cleanup failed: {}", e)),
        };
        if let Err(e) = self.store.mark_artifact_purged(job.id) {
            return Outcome::retryable(format!("cannot record purge: {}", e));
        }

        info!(
            job_id = job.id,
            "Purged local files of job {} ({} removed)",
            job.id,
            removed
        );
        self.logs
            .note(job.id, &format!("CLEANUP: {} paths removed", removed))
            .await;
        Outcome::Completed(StageOutput::empty())
    }
}
