//! Seams to the external services each stage talks to.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Job, Outcome};

/// A failure reported by an external collaborator (importer, uploader, ...).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{service}: {message}")]
pub struct CollaboratorError {
    pub service: String,
    pub message: String,
    /// Whether the stage should be retried under the retry policy.
    pub retryable: bool,
}

impl CollaboratorError {
    pub fn retryable(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// The failed-stage outcome carrying this error.
    pub fn into_outcome(self) -> Outcome {
        Outcome::Failed {
            reason: self.to_string(),
            retryable: self.retryable,
        }
    }
}

/// Inputs placed in a job's workspace by the import stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedInputs {
    pub image: PathBuf,
    pub audio: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_duration_secs: Option<f64>,
}

/// Brings a release's source files into the local workspace.
#[async_trait]
pub trait InputFetcher: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the job's inputs into `workspace`, which already exists.
    async fn fetch(&self, job: &Job, workspace: &Path) -> Result<FetchedInputs, CollaboratorError>;
}

/// Verdict of an automated quality check.
#[derive(Debug, Clone, PartialEq)]
pub enum QaVerdict {
    Passed,
    /// The artifact is unusable. Terminal for the job.
    Failed { reason: String },
}

/// Automated checks on the rendered artifact.
#[async_trait]
pub trait QaCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, job: &Job, artifact: &Path) -> Result<QaVerdict, CollaboratorError>;
}

/// Uploads the artifact to the video host.
#[async_trait]
pub trait Uploader: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the URL of the uploaded (unlisted) video.
    async fn upload(&self, job: &Job, artifact: &Path) -> Result<String, CollaboratorError>;
}

/// Makes an approved upload public.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, job: &Job, upload_url: &str) -> Result<(), CollaboratorError>;
}
