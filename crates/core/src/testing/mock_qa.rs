//! Mock QA check for testing.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::job::Job;
use crate::worker::{CollaboratorError, QaCheck, QaVerdict};

/// Mock implementation of the QaCheck trait.
///
/// Passes every artifact unless a verdict or error was queued for the next
/// call.
#[derive(Debug)]
pub struct MockQaCheck {
    checks: Arc<RwLock<usize>>,
    next_verdict: Arc<RwLock<Option<QaVerdict>>>,
    next_error: Arc<RwLock<Option<CollaboratorError>>>,
}

impl Default for MockQaCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl MockQaCheck {
    pub fn new() -> Self {
        Self {
            checks: Arc::new(RwLock::new(0)),
            next_verdict: Arc::new(RwLock::new(None)),
            next_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Return `verdict` from the next check only.
    pub async fn set_next_verdict(&self, verdict: QaVerdict) {
        *self.next_verdict.write().await = Some(verdict);
    }

    pub async fn set_next_error(&self, error: CollaboratorError) {
        *self.next_error.write().await = Some(error);
    }

    pub async fn check_count(&self) -> usize {
        *self.checks.read().await
    }
}

#[async_trait]
impl QaCheck for MockQaCheck {
    fn name(&self) -> &str {
        "mock-qa"
    }

    async fn check(&self, _job: &Job, _artifact: &Path) -> Result<QaVerdict, CollaboratorError> {
        *self.checks.write().await += 1;

        if let Some(error) = self.next_error.write().await.take() {
            return Err(error);
        }
        Ok(self
            .next_verdict
            .write()
            .await
            .take()
            .unwrap_or(QaVerdict::Passed))
    }
}
