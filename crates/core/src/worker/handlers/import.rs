//! Pulls the release inputs into the job workspace.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::job::{Job, Outcome, StageOutput};
use crate::joblog::JobLogs;
use crate::worker::handler::Handler;
use crate::worker::traits::InputFetcher;

/// Fetches inputs into the job workspace and writes the inputs manifest.
pub struct ImportHandler {
    fetcher: Arc<dyn InputFetcher>,
    logs: JobLogs,
}

impl ImportHandler {
    pub fn new(fetcher: Arc<dyn InputFetcher>, logs: JobLogs) -> Self {
        Self { fetcher, logs }
    }
}

#[async_trait]
impl Handler for ImportHandler {
    async fn execute(&self, job: &Job) -> Outcome {
        let layout = self.logs.layout();
        let workspace = layout.workspace_dir(job.id);
        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            return Outcome::retryable(format!(
                "cannot create workspace {}: {}",
                workspace.display(),
                e
            ));
        }

        let inputs = match self.fetcher.fetch(job, &workspace).await {
            Ok(inputs) => inputs,
            Err(e) => {
                warn!(
                    job_id = job.id,
                    attempt = job.attempt_no(),
                    "Import of job {} via {} failed: {}",
                    job.id,
                    self.fetcher.name(),
                    e
                );
                self.logs
                    .note(job.id, &format!("IMPORT FAILED: {}", e))
                    .await;
                return e.into_outcome();
            }
        };

        let manifest = layout.inputs_manifest(job.id);
        let written = match serde_json::to_vec_pretty(&inputs) {
            Ok(json) => tokio::fs::write(&manifest, json).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = written {
            return Outcome::retryable(format!("cannot write {}: {}", manifest.display(), e));
        }

        self.logs
            .note(
                job.id,
                &format!(
                    "IMPORT: image={} audio={}",
                    inputs.image.display(),
                    inputs.audio.display()
                ),
            )
            .await;
        Outcome::Completed(StageOutput::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::StorageLayout;
    use crate::testing::{fixtures, MockInputFetcher};
    use crate::worker::traits::{CollaboratorError, FetchedInputs};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_import_writes_manifest() {
        let dir = TempDir::new().unwrap();
        let logs = JobLogs::new(StorageLayout::new(dir.path()));
        let fetcher = Arc::new(MockInputFetcher::new());
        let handler = ImportHandler::new(fetcher.clone(), logs.clone());
        let job = fixtures::job_with_inputs(3, "/src/a.png", "/src/a.wav");

        let outcome = handler.execute(&job).await;
        assert_eq!(outcome, Outcome::Completed(StageOutput::empty()));
        assert_eq!(fetcher.recorded_fetches().await, vec![3]);

        let manifest = std::fs::read_to_string(logs.layout().inputs_manifest(3)).unwrap();
        let inputs: FetchedInputs = serde_json::from_str(&manifest).unwrap();
        assert!(inputs.image.starts_with(logs.layout().workspace_dir(3)));
    }

    #[tokio::test]
    async fn test_import_failure_maps_retryability() {
        let dir = TempDir::new().unwrap();
        let logs = JobLogs::new(StorageLayout::new(dir.path()));
        let fetcher = Arc::new(MockInputFetcher::new());
        let handler = ImportHandler::new(fetcher.clone(), logs.clone());
        let job = fixtures::job_with_inputs(4, "/src/a.png", "/src/a.wav");

        fetcher
            .set_next_error(CollaboratorError::fatal("importer", "gone"))
            .await;
        let outcome = handler.execute(&job).await;
        assert_eq!(outcome, Outcome::fatal("importer: gone"));

        let tail = logs.tail(4, 1).await.unwrap();
        assert!(tail[0].contains("IMPORT FAILED: importer: gone"));
    }
}
