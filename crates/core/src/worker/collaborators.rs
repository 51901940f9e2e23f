//! Built-in collaborator implementations.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::traits::{CollaboratorError, FetchedInputs, InputFetcher, QaCheck, QaVerdict, Uploader};
use crate::job::Job;
use crate::render::{ArtifactProbe, RenderError};

/// Copies the image and audio named in the job metadata into the workspace.
#[derive(Debug, Clone, Default)]
pub struct LocalInputFetcher;

impl LocalInputFetcher {
    async fn copy_into(
        &self,
        source: &Path,
        workspace: &Path,
        stem: &str,
    ) -> Result<std::path::PathBuf, CollaboratorError> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(CollaboratorError::retryable(
                self.name(),
                format!("{} does not exist", source.display()),
            ));
        }
        let dest = match source.extension() {
            Some(ext) => workspace.join(format!("{}.{}", stem, ext.to_string_lossy())),
            None => workspace.join(stem),
        };
        tokio::fs::copy(source, &dest).await.map_err(|e| {
            CollaboratorError::retryable(
                self.name(),
                format!("copy {} -> {}: {}", source.display(), dest.display(), e),
            )
        })?;
        debug!("Imported {} as {}", source.display(), dest.display());
        Ok(dest)
    }
}

#[async_trait]
impl InputFetcher for LocalInputFetcher {
    fn name(&self) -> &str {
        "local-import"
    }

    async fn fetch(&self, job: &Job, workspace: &Path) -> Result<FetchedInputs, CollaboratorError> {
        let image = job
            .metadata
            .image
            .as_deref()
            .ok_or_else(|| CollaboratorError::fatal(self.name(), "release has no cover image"))?;
        let audio = job
            .metadata
            .audio
            .as_deref()
            .ok_or_else(|| CollaboratorError::fatal(self.name(), "release has no audio track"))?;

        Ok(FetchedInputs {
            image: self.copy_into(image, workspace, "cover").await?,
            audio: self.copy_into(audio, workspace, "audio").await?,
            expected_duration_secs: job.metadata.expected_duration_secs,
        })
    }
}

/// Checks the artifact with an [`ArtifactProbe`] and compares its duration.
pub struct ProbeQaCheck {
    probe: Arc<dyn ArtifactProbe>,
    /// Allowed difference between expected and actual duration.
    duration_tolerance_secs: f64,
}

impl ProbeQaCheck {
    pub fn new(probe: Arc<dyn ArtifactProbe>) -> Self {
        Self {
            probe,
            duration_tolerance_secs: 2.0,
        }
    }

    pub fn with_duration_tolerance(mut self, secs: f64) -> Self {
        self.duration_tolerance_secs = secs;
        self
    }
}

#[async_trait]
impl QaCheck for ProbeQaCheck {
    fn name(&self) -> &str {
        "probe-qa"
    }

    async fn check(&self, job: &Job, artifact: &Path) -> Result<QaVerdict, CollaboratorError> {
        let info = match self.probe.inspect(artifact).await {
            Ok(info) => info,
            Err(RenderError::Probe { reason }) => return Ok(QaVerdict::Failed { reason }),
            Err(e) => return Err(CollaboratorError::retryable(self.name(), e.to_string())),
        };

        if let (Some(expected), Some(actual)) =
            (job.metadata.expected_duration_secs, info.duration_secs)
        {
            if (expected - actual).abs() > self.duration_tolerance_secs {
                return Ok(QaVerdict::Failed {
                    reason: format!(
                        "duration {:.1}s differs from expected {:.1}s",
                        actual, expected
                    ),
                });
            }
        }
        Ok(QaVerdict::Passed)
    }
}

/// Pretends to upload and returns a `dryrun://` URL.
#[derive(Debug, Clone, Default)]
pub struct DryRunUploader;

#[async_trait]
impl Uploader for DryRunUploader {
    fn name(&self) -> &str {
        "dry-run-upload"
    }

    async fn upload(&self, job: &Job, artifact: &Path) -> Result<String, CollaboratorError> {
        let meta = tokio::fs::metadata(artifact).await.map_err(|e| {
            CollaboratorError::retryable(self.name(), format!("{}: {}", artifact.display(), e))
        })?;
        debug!(
            "Dry-run upload of {} ({} bytes) for job {}",
            artifact.display(),
            meta.len(),
            job.id
        );
        Ok(format!("dryrun://{}/{}", job.channel_slug, job.id))
    }
}
