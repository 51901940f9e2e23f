//! Core job data types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Jobs are keyed by an autoincrementing integer, so ids are creation-ordered.
pub type JobId = i64;

/// Implements `as_str`, `Display` and `FromStr` for the snake_case enums
/// persisted as TEXT columns.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Persisted representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

// ============================================================================
// Pipeline vocabulary
// ============================================================================

/// A named pipeline phase. Jobs move through stages in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Import,
    Render,
    Qa,
    Upload,
    Approval,
    Publish,
    Cleanup,
}

text_enum!(Stage {
    Import => "import",
    Render => "render",
    Qa => "qa",
    Upload => "upload",
    Approval => "approval",
    Publish => "publish",
    Cleanup => "cleanup",
});

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Stage; 7] = [
        Stage::Import,
        Stage::Render,
        Stage::Qa,
        Stage::Upload,
        Stage::Approval,
        Stage::Publish,
        Stage::Cleanup,
    ];

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Import => Some(Stage::Render),
            Stage::Render => Some(Stage::Qa),
            Stage::Qa => Some(Stage::Upload),
            Stage::Upload => Some(Stage::Approval),
            Stage::Approval => Some(Stage::Publish),
            Stage::Publish => Some(Stage::Cleanup),
            Stage::Cleanup => None,
        }
    }
}

/// Lifecycle status of a job within its current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Leased by a worker that has not started the handler yet.
    Claimed,
    /// Leased and executing.
    Running,
    /// Failed at least once; claimable again once `retry_at` has passed.
    Retrying,
    /// Terminal failure.
    FailedPermanent,
    /// Terminal success.
    Done,
}

text_enum!(JobStatus {
    Pending => "pending",
    Claimed => "claimed",
    Running => "running",
    Retrying => "retrying",
    FailedPermanent => "failed_permanent",
    Done => "done",
});

impl JobStatus {
    /// Terminal rows are immutable apart from artifact purging.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::FailedPermanent | JobStatus::Done)
    }

    /// Whether a worker currently holds (or held, if expired) the lease.
    pub fn is_leased(&self) -> bool {
        matches!(self, JobStatus::Claimed | JobStatus::Running)
    }

    /// Whether the job is waiting for a worker.
    pub fn is_waiting(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying)
    }
}

/// QA verdict recorded on the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaState {
    #[default]
    None,
    Passed,
    Failed,
}

text_enum!(QaState {
    None => "none",
    Passed => "passed",
    Failed => "failed",
});

/// Human approval state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    #[default]
    None,
    Pending,
    Approved,
    Rejected,
}

text_enum!(ApprovalState {
    None => "none",
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

/// Publication state on the destination platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishState {
    #[default]
    None,
    Pending,
    Published,
}

text_enum!(PublishState {
    None => "none",
    Pending => "pending",
    Published => "published",
});

// ============================================================================
// Release metadata
// ============================================================================

/// Release description handed over by the importer.
///
/// Unknown keys are preserved in `extra` so collaborators can carry their own
/// data through the pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReleaseMetadata {
    /// Human readable title, used in logs.
    #[serde(default)]
    pub title: String,
    /// Cover image rendered as the video track.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
    /// Audio track.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<PathBuf>,
    /// Expected duration of the rendered video, used for progress and QA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_duration_secs: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ReleaseMetadata {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_audio(mut self, audio: impl Into<PathBuf>) -> Self {
        self.audio = Some(audio.into());
        self
    }

    pub fn with_expected_duration(mut self, secs: f64) -> Self {
        self.expected_duration_secs = Some(secs);
        self
    }
}

// ============================================================================
// Job
// ============================================================================

/// The unit of work moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub channel_slug: String,
    pub release_ref: String,
    pub metadata: ReleaseMetadata,
    pub stage: Stage,
    pub status: JobStatus,
    /// Worker currently holding the lease.
    pub owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Failed attempts in the current stage.
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Consecutive lease-expiry reclamations without an applied transition.
    pub reclaim_count: u32,
    /// Earliest time a retrying job becomes claimable again.
    pub retry_at: Option<DateTime<Utc>>,
    /// Encoder used by the last successful render (0 = primary, 1 = fallback).
    pub encoder_attempt: u8,
    pub artifact_path: Option<PathBuf>,
    pub upload_url: Option<String>,
    pub qa_state: QaState,
    pub approval_state: ApprovalState,
    pub publish_state: PublishState,
    pub published_at: Option<DateTime<Utc>>,
    /// When the local artifact becomes eligible for purging.
    pub ttl_expires_at: Option<DateTime<Utc>>,
    pub artifact_purged_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the lease is held and has not expired at `now`.
    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.status.is_leased() && self.lease_expires_at.is_some_and(|at| at >= now)
    }

    /// 1-based number of the attempt a worker is about to make.
    pub fn attempt_no(&self) -> u32 {
        self.attempt_count + 1
    }

    /// Short label for log lines.
    pub fn label(&self) -> String {
        format!("{}/{}", self.channel_slug, self.release_ref)
    }
}

/// Who is asking for a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// A worker that must hold the job's lease.
    Worker(String),
    /// An external operator (approval bot, admin CLI). Never holds a lease.
    Operator(String),
}

impl Actor {
    pub fn worker(id: impl Into<String>) -> Self {
        Actor::Worker(id.into())
    }

    pub fn operator(name: impl Into<String>) -> Self {
        Actor::Operator(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Actor::Worker(id) | Actor::Operator(id) => id,
        }
    }
}

/// Data produced by a successfully completed stage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageOutput {
    pub artifact_path: Option<PathBuf>,
    pub upload_url: Option<String>,
    pub encoder_attempt: Option<u8>,
}

impl StageOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn artifact(path: impl Into<PathBuf>, encoder_attempt: u8) -> Self {
        Self {
            artifact_path: Some(path.into()),
            encoder_attempt: Some(encoder_attempt),
            ..Default::default()
        }
    }

    pub fn uploaded(url: impl Into<String>) -> Self {
        Self {
            upload_url: Some(url.into()),
            ..Default::default()
        }
    }
}

/// Result of executing a stage, or an external decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The worker finished its stage.
    Completed(StageOutput),
    /// The worker's stage failed.
    Failed { reason: String, retryable: bool },
    /// Operator approved the uploaded video.
    Approve,
    /// Operator rejected the uploaded video.
    Reject { reason: Option<String> },
    /// Operator confirmed the video is live.
    MarkPublished,
}

impl Outcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
            retryable: false,
        }
    }

    /// Decisions made outside the worker pool (approval bot, admin CLI).
    pub fn is_decision(&self) -> bool {
        matches!(
            self,
            Outcome::Approve | Outcome::Reject { .. } | Outcome::MarkPublished
        )
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Completed(_) => "completed",
            Outcome::Failed { .. } => "failed",
            Outcome::Approve => "approve",
            Outcome::Reject { .. } => "reject",
            Outcome::MarkPublished => "mark_published",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let mut stage = Stage::Import;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen, Stage::ALL.to_vec());
    }

    #[test]
    fn test_text_enum_parse() {
        assert_eq!("qa".parse::<Stage>().unwrap(), Stage::Qa);
        assert_eq!(
            "failed_permanent".parse::<JobStatus>().unwrap(),
            JobStatus::FailedPermanent
        );
        assert!("shipping".parse::<Stage>().is_err());
        assert_eq!(ApprovalState::Rejected.to_string(), "rejected");
    }

    #[test]
    fn test_status_classes() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::FailedPermanent.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(JobStatus::Claimed.is_leased());
        assert!(JobStatus::Retrying.is_waiting());
    }

    #[test]
    fn test_metadata_keeps_unknown_keys() {
        let json = r#"{"title":"Night Drive","audio":"/in/a.flac","genre":"synthwave"}"#;
        let meta: ReleaseMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.title, "Night Drive");
        assert_eq!(meta.audio, Some(PathBuf::from("/in/a.flac")));
        assert_eq!(meta.extra.get("genre").unwrap(), "synthwave");

        let back = serde_json::to_string(&meta).unwrap();
        assert!(back.contains("\"genre\":\"synthwave\""));
    }
}
