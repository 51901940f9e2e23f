//! Mock input fetcher for testing.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::job::{Job, JobId};
use crate::worker::{CollaboratorError, FetchedInputs, InputFetcher};

/// Mock implementation of the InputFetcher trait.
///
/// Writes small placeholder files into the workspace instead of importing
/// anything, and records which jobs were fetched.
///
/// # Example
///
/// ```rust,ignore
/// use pressline_core::testing::MockInputFetcher;
///
/// let fetcher = MockInputFetcher::new();
/// fetcher.set_next_error(CollaboratorError::retryable("importer", "timeout")).await;
///
/// // ... run an import worker ...
///
/// assert_eq!(fetcher.recorded_fetches().await, vec![job.id]);
/// ```
#[derive(Debug)]
pub struct MockInputFetcher {
    /// Jobs fetched, in call order.
    fetches: Arc<RwLock<Vec<JobId>>>,
    /// If set, the next fetch will fail with this error.
    next_error: Arc<RwLock<Option<CollaboratorError>>>,
    /// Simulated fetch duration.
    delay: Arc<RwLock<Duration>>,
}

impl Default for MockInputFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockInputFetcher {
    pub fn new() -> Self {
        Self {
            fetches: Arc::new(RwLock::new(Vec::new())),
            next_error: Arc::new(RwLock::new(None)),
            delay: Arc::new(RwLock::new(Duration::ZERO)),
        }
    }

    /// Set an error to be returned on the next fetch.
    pub async fn set_next_error(&self, error: CollaboratorError) {
        *self.next_error.write().await = Some(error);
    }

    /// Make every fetch take at least `delay`.
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = delay;
    }

    /// Get all recorded fetches.
    pub async fn recorded_fetches(&self) -> Vec<JobId> {
        self.fetches.read().await.clone()
    }
}

#[async_trait]
impl InputFetcher for MockInputFetcher {
    fn name(&self) -> &str {
        "mock-import"
    }

    async fn fetch(&self, job: &Job, workspace: &Path) -> Result<FetchedInputs, CollaboratorError> {
        self.fetches.write().await.push(job.id);

        let delay = *self.delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.next_error.write().await.take() {
            return Err(error);
        }

        let image = workspace.join("cover.png");
        let audio = workspace.join("audio.wav");
        for (path, bytes) in [(&image, &b"png"[..]), (&audio, &b"wav"[..])] {
            tokio::fs::write(path, bytes)
                .await
                .map_err(|e| CollaboratorError::retryable(self.name(), e.to_string()))?;
        }

        Ok(FetchedInputs {
            image,
            audio,
            expected_duration_secs: job.metadata.expected_duration_secs,
        })
    }
}
