//! Upload of the validated artifact, and publication through an external publisher.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::artifact_of;
use crate::job::{Job, Outcome, StageOutput};
use crate::joblog::JobLogs;
use crate::worker::handler::Handler;
use crate::worker::traits::{Publisher, Uploader};

/// Uploads the rendered artifact; the job then waits for approval.
pub struct UploadHandler {
    uploader: Arc<dyn Uploader>,
    logs: JobLogs,
}

impl UploadHandler {
    pub fn new(uploader: Arc<dyn Uploader>, logs: JobLogs) -> Self {
        Self { uploader, logs }
    }
}

#[async_trait]
impl Handler for UploadHandler {
    async fn execute(&self, job: &Job) -> Outcome {
        let artifact = artifact_of(job, self.logs.layout());
        match self.uploader.upload(job, &artifact).await {
            Ok(url) => {
                info!(job_id = job.id, "Job {} uploaded to {}", job.id, url);
                self.logs.note(job.id, &format!("UPLOAD: {}", url)).await;
                Outcome::Completed(StageOutput::uploaded(url))
            }
            Err(e) => {
                self.logs
                    .note(job.id, &format!("UPLOAD FAILED: {}", e))
                    .await;
                e.into_outcome()
            }
        }
    }
}

/// Makes an approved upload public.
pub struct PublishHandler {
    publisher: Arc<dyn Publisher>,
    logs: JobLogs,
}

impl PublishHandler {
    pub fn new(publisher: Arc<dyn Publisher>, logs: JobLogs) -> Self {
        Self { publisher, logs }
    }
}

#[async_trait]
impl Handler for PublishHandler {
    async fn execute(&self, job: &Job) -> Outcome {
        let Some(url) = job.upload_url.as_deref() else {
            return Outcome::fatal("no upload URL recorded");
        };
        match self.publisher.publish(job, url).await {
            Ok(()) => {
                self.logs.note(job.id, &format!("PUBLISH: {}", url)).await;
                Outcome::Completed(StageOutput::empty())
            }
            Err(e) => {
                self.logs
                    .note(job.id, &format!("PUBLISH FAILED: {}", e))
                    .await;
                e.into_outcome()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::StorageLayout;
    use crate::testing::{fixtures, MockPublisher, MockUploader};
    use crate::worker::traits::CollaboratorError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_records_url() {
        let dir = TempDir::new().unwrap();
        let logs = JobLogs::new(StorageLayout::new(dir.path()));
        let uploader = Arc::new(MockUploader::new());
        let handler = UploadHandler::new(uploader.clone(), logs);
        let job = fixtures::job_with_inputs(5, "/a.png", "/a.wav");

        let outcome = handler.execute(&job).await;
        assert_eq!(
            outcome,
            Outcome::Completed(StageOutput::uploaded("mock://upload/5"))
        );
        assert_eq!(uploader.recorded_uploads().await.len(), 1);

        uploader
            .set_next_error(CollaboratorError::retryable("uploader", "quota"))
            .await;
        assert_eq!(
            handler.execute(&job).await,
            Outcome::retryable("uploader: quota")
        );
    }

    #[tokio::test]
    async fn test_publish_requires_upload_url() {
        let dir = TempDir::new().unwrap();
        let logs = JobLogs::new(StorageLayout::new(dir.path()));
        let publisher = Arc::new(MockPublisher::new());
        let handler = PublishHandler::new(publisher.clone(), logs);

        let mut job = fixtures::job_with_inputs(6, "/a.png", "/a.wav");
        assert!(matches!(
            handler.execute(&job).await,
            Outcome::Failed { retryable: false, .. }
        ));

        job.upload_url = Some("mock://upload/6".to_string());
        assert_eq!(
            handler.execute(&job).await,
            Outcome::Completed(StageOutput::empty())
        );
        assert_eq!(
            publisher.recorded_publishes().await,
            vec![(6, "mock://upload/6".to_string())]
        );
    }
}
