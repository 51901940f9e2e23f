//! Mock uploader and publisher for testing.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::job::{Job, JobId};
use crate::worker::{CollaboratorError, Publisher, Uploader};

/// A recorded upload for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedUpload {
    pub job_id: JobId,
    pub artifact: PathBuf,
}

/// Mock implementation of the Uploader trait.
///
/// Returns `mock://upload/<job id>` for every successful upload.
#[derive(Debug)]
pub struct MockUploader {
    uploads: Arc<RwLock<Vec<RecordedUpload>>>,
    next_error: Arc<RwLock<Option<CollaboratorError>>>,
}

impl Default for MockUploader {
    fn default() -> Self {
        Self::new()
    }
}

impl MockUploader {
    pub fn new() -> Self {
        Self {
            uploads: Arc::new(RwLock::new(Vec::new())),
            next_error: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn set_next_error(&self, error: CollaboratorError) {
        *self.next_error.write().await = Some(error);
    }

    /// Successful uploads only.
    pub async fn recorded_uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.read().await.clone()
    }
}

#[async_trait]
impl Uploader for MockUploader {
    fn name(&self) -> &str {
        "mock-upload"
    }

    async fn upload(&self, job: &Job, artifact: &Path) -> Result<String, CollaboratorError> {
        if let Some(error) = self.next_error.write().await.take() {
            return Err(error);
        }
        self.uploads.write().await.push(RecordedUpload {
            job_id: job.id,
            artifact: artifact.to_path_buf(),
        });
        Ok(format!("mock://upload/{}", job.id))
    }
}

/// Mock implementation of the Publisher trait.
#[derive(Debug)]
pub struct MockPublisher {
    publishes: Arc<RwLock<Vec<(JobId, String)>>>,
    next_error: Arc<RwLock<Option<CollaboratorError>>>,
}

impl Default for MockPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPublisher {
    pub fn new() -> Self {
        Self {
            publishes: Arc::new(RwLock::new(Vec::new())),
            next_error: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn set_next_error(&self, error: CollaboratorError) {
        *self.next_error.write().await = Some(error);
    }

    pub async fn recorded_publishes(&self) -> Vec<(JobId, String)> {
        self.publishes.read().await.clone()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    fn name(&self) -> &str {
        "mock-publish"
    }

    async fn publish(&self, job: &Job, upload_url: &str) -> Result<(), CollaboratorError> {
        if let Some(error) = self.next_error.write().await.take() {
            return Err(error);
        }
        self.publishes
            .write()
            .await
            .push((job.id, upload_url.to_string()));
        Ok(())
    }
}
