//! Job storage trait and types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{Actor, Job, JobId, JobStatus, Outcome, ReleaseMetadata, Stage};
use crate::machine::{Phase, TransitionError};
use crate::worker::Role;

/// Error type for job store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// A non-terminal job already exists for this release.
    #[error("Release {channel}/{release_ref} already has an active job")]
    DuplicateRelease { channel: String, release_ref: String },

    /// The requested hop is not in the transition table.
    #[error("Job {job_id}: invalid transition {from} -> {to}")]
    InvalidTransition { job_id: JobId, from: Phase, to: Phase },

    /// The caller no longer owns the job's lease.
    #[error("Job {job_id}: lease lost by {worker_id}")]
    LeaseLost { job_id: JobId, worker_id: String },

    /// The database was locked by another writer for longer than the busy timeout.
    #[error("Store busy: {0}")]
    Busy(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),
}

impl JobError {
    pub(crate) fn invalid(job_id: JobId, err: TransitionError) -> Self {
        JobError::InvalidTransition {
            job_id,
            from: err.from,
            to: err.to,
        }
    }

    pub(crate) fn lease_lost(job_id: JobId, worker_id: &str) -> Self {
        JobError::LeaseLost {
            job_id,
            worker_id: worker_id.to_string(),
        }
    }

    /// Caller bugs: surfaced immediately and never retried.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            JobError::InvalidTransition { .. } | JobError::DuplicateRelease { .. }
        )
    }

    /// The current attempt should be abandoned and the worker should return
    /// to its poll loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::LeaseLost { .. } | JobError::Busy(_))
    }
}

/// Request to create a new job.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub channel_slug: String,
    pub release_ref: String,
    pub metadata: ReleaseMetadata,
    /// Overrides the store's default attempts per stage.
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(
        channel_slug: impl Into<String>,
        release_ref: impl Into<String>,
        metadata: ReleaseMetadata,
    ) -> Self {
        Self {
            channel_slug: channel_slug.into(),
            release_ref: release_ref.into(),
            metadata,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Filter for querying jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub stage: Option<Stage>,
    pub status: Option<JobStatus>,
    pub channel_slug: Option<String>,
    /// Maximum number of results.
    pub limit: i64,
    /// Offset for pagination.
    pub offset: i64,
}

impl JobFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            stage: None,
            status: None,
            channel_slug: None,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_channel(mut self, channel_slug: impl Into<String>) -> Self {
        self.channel_slug = Some(channel_slug.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Durable job storage with the claim and transition primitives.
///
/// Every mutating call is a short conditional write: implementations must
/// guarantee that two concurrent `claim` calls never both obtain the same job
/// and that `transition`/`heartbeat` fail with [`JobError::LeaseLost`] once
/// another worker has taken over.
pub trait JobStore: Send + Sync {
    /// Create a job at `import:pending`.
    fn enqueue(&self, request: EnqueueRequest) -> Result<Job, JobError>;

    /// Get a job by ID.
    fn get(&self, id: JobId) -> Result<Option<Job>, JobError>;

    /// List jobs matching the filter, oldest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError>;

    /// Count jobs matching the filter (ignores limit/offset).
    fn count(&self, filter: &JobFilter) -> Result<i64, JobError>;

    /// Atomically lease the oldest eligible job for `role`.
    ///
    /// Eligible means waiting in the role's stage and past any retry or TTL
    /// gate, or leased with an expired lease.
    fn claim(&self, role: Role, worker_id: &str, lease: Duration)
        -> Result<Option<Job>, JobError>;

    /// Mark a claimed job as running.
    fn start(&self, id: JobId, worker_id: &str) -> Result<Job, JobError>;

    /// Extend the lease. Returns the new expiry.
    fn heartbeat(
        &self,
        id: JobId,
        worker_id: &str,
        extension: Duration,
    ) -> Result<DateTime<Utc>, JobError>;

    /// Apply an outcome through the state machine.
    fn transition(&self, id: JobId, actor: &Actor, outcome: Outcome) -> Result<Job, JobError>;

    /// Give a leased job back without consuming an attempt. Workers call
    /// this when shutdown interrupts the job they hold.
    fn release(&self, id: JobId, worker_id: &str) -> Result<Job, JobError>;

    /// Fail a non-terminal job permanently. Any current owner loses its lease.
    fn cancel(&self, id: JobId, reason: &str) -> Result<Job, JobError>;

    /// Drop a lease so the job is immediately claimable again.
    fn force_unlock(&self, id: JobId) -> Result<Job, JobError>;

    /// Record that the local artifact has been deleted.
    fn mark_artifact_purged(&self, id: JobId) -> Result<(), JobError>;

    /// Approve an uploaded video. Only valid at `approval:pending`.
    fn approve(&self, id: JobId, operator: &str) -> Result<Job, JobError> {
        self.transition(id, &Actor::operator(operator), Outcome::Approve)
    }

    /// Reject an uploaded video. Only valid at `approval:pending`.
    fn reject(&self, id: JobId, operator: &str, reason: Option<String>) -> Result<Job, JobError> {
        self.transition(id, &Actor::operator(operator), Outcome::Reject { reason })
    }

    /// Confirm publication. Only valid at `publish:pending`.
    fn mark_published(&self, id: JobId, operator: &str) -> Result<Job, JobError> {
        self.transition(id, &Actor::operator(operator), Outcome::MarkPublished)
    }
}
