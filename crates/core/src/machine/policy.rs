//! Retry and retention policy applied by the state machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the retry delay grows between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay after every failure.
    #[default]
    Fixed,
    /// Delay doubles after every failure, capped at `max`.
    Exponential,
}

/// Delay applied before a retrying job becomes claimable again.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed,
            base: delay,
            max: delay,
        }
    }

    /// Zero delay, handy when tests want retries to be immediately claimable.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Delay after the `failures`-th failure (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base,
            Backoff::Exponential => {
                let exp = failures.saturating_sub(1).min(20);
                self.base.saturating_mul(1u32 << exp).min(self.max)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::Fixed,
            base: Duration::from_secs(300),
            max: Duration::from_secs(3600),
        }
    }
}

/// Everything the store needs to apply outcomes.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelinePolicy {
    pub retry: RetryPolicy,
    /// Attempts per stage for newly enqueued jobs.
    pub max_attempts: u32,
    /// How long a published artifact is kept locally.
    pub artifact_ttl: Duration,
    /// Lease-expiry reclamations tolerated before a job is failed.
    pub stale_reclaim_limit: u32,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_attempts: 3,
            artifact_ttl: Duration::from_secs(48 * 3600),
            stale_reclaim_limit: 3,
        }
    }
}

impl PipelinePolicy {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_artifact_ttl(mut self, ttl: Duration) -> Self {
        self.artifact_ttl = ttl;
        self
    }

    pub fn with_stale_reclaim_limit(mut self, limit: u32) -> Self {
        self.stale_reclaim_limit = limit;
        self
    }
}
