//! Renders the release video under the supervisor.

use std::sync::Arc;

use async_trait::async_trait;

use crate::job::{Job, Outcome, StageOutput};
use crate::joblog::JobLogs;
use crate::render::{RenderError, RenderRequest, RenderSupervisor};
use crate::worker::handler::Handler;
use crate::worker::traits::FetchedInputs;

/// Renders the imported inputs into the job's outbox.
pub struct RenderHandler {
    supervisor: Arc<RenderSupervisor>,
    logs: JobLogs,
}

impl RenderHandler {
    pub fn new(supervisor: Arc<RenderSupervisor>, logs: JobLogs) -> Self {
        Self { supervisor, logs }
    }

    async fn request_for(&self, job: &Job) -> Result<RenderRequest, RenderError> {
        let layout = self.logs.layout();
        let manifest = layout.inputs_manifest(job.id);
        let raw = match tokio::fs::read(&manifest).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RenderError::InputNotFound { path: manifest });
            }
            Err(e) => return Err(e.into()),
        };
        let inputs: FetchedInputs = serde_json::from_slice(&raw).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: {}", manifest.display(), e),
            )
        })?;

        for path in [&inputs.image, &inputs.audio] {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(RenderError::InputNotFound { path: path.clone() });
            }
        }

        Ok(RenderRequest {
            job_id: job.id,
            image: inputs.image,
            audio: inputs.audio,
            output: layout.artifact_path(job.id),
            expected_duration_secs: inputs
                .expected_duration_secs
                .or(job.metadata.expected_duration_secs),
        })
    }
}

#[async_trait]
impl Handler for RenderHandler {
    async fn execute(&self, job: &Job) -> Outcome {
        let result = match self.request_for(job).await {
            Ok(request) => self.supervisor.render(&request).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(report) => {
                self.logs
                    .note(
                        job.id,
                        &format!(
                            "RENDER: {} via {} ({} bytes, sha256 {})",
                            report.output.display(),
                            report.codec,
                            report.size_bytes,
                            report.sha256
                        ),
                    )
                    .await;
                Outcome::Completed(StageOutput::artifact(report.output, report.encoder.index()))
            }
            Err(e) => {
                self.logs
                    .note(job.id, &format!("RENDER FAILED: {}", e))
                    .await;
                Outcome::Failed {
                    reason: e.to_string(),
                    retryable: e.is_retryable(),
                }
            }
        }
    }
}
