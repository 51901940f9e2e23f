//! Quality check of the rendered artifact.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::artifact_of;
use crate::job::{Job, Outcome, StageOutput};
use crate::joblog::JobLogs;
use crate::worker::handler::Handler;
use crate::worker::traits::{QaCheck, QaVerdict};

pub struct QaHandler {
    check: Arc<dyn QaCheck>,
    logs: JobLogs,
}

impl QaHandler {
    pub fn new(check: Arc<dyn QaCheck>, logs: JobLogs) -> Self {
        Self { check, logs }
    }
}

#[async_trait]
impl Handler for QaHandler {
    async fn execute(&self, job: &Job) -> Outcome {
        let artifact = artifact_of(job, self.logs.layout());
        match self.check.check(job, &artifact).await {
            Ok(QaVerdict::Passed) => {
                self.logs
                    .note(job.id, &format!("QA: passed ({})", self.check.name()))
                    .await;
                Outcome::Completed(StageOutput::empty())
            }
            Ok(QaVerdict::Failed { reason }) => {
                warn!(job_id = job.id, "QA rejected job {}: {}", job.id, reason);
                self.logs
                    .note(job.id, &format!("QA: failed: {}", reason))
                    .await;
                Outcome::fatal(format!("qa failed: {}", reason))
            }
            Err(e) => {
                self.logs
                    .note(job.id, &format!("QA ERROR: {}", e))
                    .await;
                e.into_outcome()
            }
        }
    }
}
