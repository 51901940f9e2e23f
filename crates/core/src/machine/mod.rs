//! Stage state machine.
//!
//! Pure functions that turn a job plus an [`Outcome`] into the next job
//! value. Every hop is validated against the explicit transition table, so the
//! store never has to reason about stage ordering itself.

mod policy;
mod table;

pub use policy::{Backoff, PipelinePolicy, RetryPolicy};
pub use table::{check, check_path, is_allowed, Phase, Step, TransitionError, TRANSITIONS};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::job::{
    Actor, ApprovalState, Job, JobStatus, Outcome, PublishState, QaState, Stage,
};

/// `now + d`, saturating instead of overflowing.
pub(crate) fn later(now: DateTime<Utc>, d: std::time::Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Computes the job that results from applying `outcome` at `now`.
///
/// The returned job has its lease cleared and its reclaim counter reset; the
/// caller is responsible for ownership checks and persistence.
pub fn advance(
    job: &Job,
    outcome: &Outcome,
    policy: &PipelinePolicy,
    now: DateTime<Utc>,
) -> Result<Job, TransitionError> {
    let from = Phase::of(job);
    let stage = job.stage;
    let mut next = job.clone();
    next.owner = None;
    next.lease_expires_at = None;
    next.reclaim_count = 0;
    next.updated_at = now;

    let path = match outcome {
        Outcome::Completed(output) => {
            let path = completion_path(from);
            check_path(&path)?;
            if let Some(artifact) = &output.artifact_path {
                next.artifact_path = Some(artifact.clone());
            }
            if let Some(url) = &output.upload_url {
                next.upload_url = Some(url.clone());
            }
            if let Some(encoder) = output.encoder_attempt {
                next.encoder_attempt = encoder;
            }
            path
        }
        Outcome::Failed { reason, retryable } => {
            let failures = job.attempt_count.saturating_add(1);
            let retry = *retryable && failures < job.max_attempts;
            let to = if retry {
                Phase::new(stage, Step::Pending)
            } else {
                Phase::new(stage, Step::Failed)
            };
            let path = vec![from, to];
            check_path(&path)?;
            next.attempt_count = failures.min(job.max_attempts);
            next.error_message = Some(reason.clone());
            if retry {
                next.status = JobStatus::Retrying;
                next.retry_at = Some(later(now, policy.retry.delay_for(failures)));
            } else {
                next.status = JobStatus::FailedPermanent;
                next.retry_at = None;
                if stage == Stage::Qa {
                    next.qa_state = QaState::Failed;
                }
            }
            return Ok(next);
        }
        Outcome::Approve => vec![
            from,
            Phase::new(Stage::Approval, Step::Approved),
            Phase::new(Stage::Publish, Step::Pending),
        ],
        Outcome::Reject { reason } => {
            let path = vec![from, Phase::new(Stage::Approval, Step::Rejected)];
            check_path(&path)?;
            next.approval_state = ApprovalState::Rejected;
            next.status = JobStatus::Done;
            next.error_message = reason.clone();
            return Ok(next);
        }
        Outcome::MarkPublished => vec![
            from,
            Phase::new(Stage::Publish, Step::Done),
            Phase::new(Stage::Cleanup, Step::Pending),
        ],
    };
    check_path(&path)?;

    let to = *path.last().unwrap_or(&from);
    next.stage = to.stage;
    next.retry_at = None;
    next.error_message = None;
    if to.stage != stage {
        next.attempt_count = 0;
    }

    // Side effects of each hop on the per-stage state columns.
    for hop in &path[1..] {
        match (hop.stage, hop.step) {
            (Stage::Qa, Step::Passed) => next.qa_state = QaState::Passed,
            (Stage::Approval, Step::Pending) => next.approval_state = ApprovalState::Pending,
            (Stage::Approval, Step::Approved) => next.approval_state = ApprovalState::Approved,
            (Stage::Publish, Step::Pending) => next.publish_state = PublishState::Pending,
            (Stage::Publish, Step::Done) => {
                next.publish_state = PublishState::Published;
                next.published_at = Some(now);
                next.ttl_expires_at = Some(later(now, policy.artifact_ttl));
            }
            _ => {}
        }
    }

    next.status = match to.step {
        Step::Pending => JobStatus::Pending,
        _ => JobStatus::Done,
    };
    Ok(next)
}

/// Checks that `actor` may apply `outcome` to `job` at all.
///
/// Workers report stage results only; operators make decisions only, and
/// never while a worker holds the lease.
pub fn authorize(job: &Job, actor: &Actor, outcome: &Outcome) -> Result<(), TransitionError> {
    let from = Phase::of(job);
    let allowed = match actor {
        Actor::Worker(_) => !outcome.is_decision(),
        Actor::Operator(_) => outcome.is_decision() && !job.status.is_leased(),
    };
    if allowed {
        Ok(())
    } else {
        Err(TransitionError {
            from,
            to: requested(from, outcome),
        })
    }
}

/// First hop `outcome` asks for, used in rejection messages.
fn requested(from: Phase, outcome: &Outcome) -> Phase {
    match outcome {
        Outcome::Completed(_) => completion_path(from)
            .get(1)
            .copied()
            .unwrap_or(from),
        Outcome::Failed { .. } => Phase::new(from.stage, Step::Failed),
        Outcome::Approve => Phase::new(Stage::Approval, Step::Approved),
        Outcome::Reject { .. } => Phase::new(Stage::Approval, Step::Rejected),
        Outcome::MarkPublished => Phase::new(Stage::Publish, Step::Done),
    }
}

/// Path a worker's successful completion takes from `from`.
fn completion_path(from: Phase) -> Vec<Phase> {
    let stage = from.stage;
    match stage {
        Stage::Qa => vec![
            from,
            Phase::new(Stage::Qa, Step::Passed),
            Phase::new(Stage::Upload, Step::Pending),
        ],
        Stage::Cleanup => vec![from, Phase::new(Stage::Cleanup, Step::Done)],
        _ => {
            let mut path = vec![from, Phase::new(stage, Step::Done)];
            if let Some(next) = stage.next() {
                path.push(Phase::new(next, Step::Pending));
            }
            path
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ReleaseMetadata, StageOutput};
    use std::time::Duration;

    fn job_at(stage: Stage, status: JobStatus) -> Job {
        let now = Utc::now();
        Job {
            id: 1,
            channel_slug: "c1".to_string(),
            release_ref: "r1".to_string(),
            metadata: ReleaseMetadata::new("Test"),
            stage,
            status,
            owner: status.is_leased().then(|| "w1".to_string()),
            lease_expires_at: None,
            attempt_count: 0,
            max_attempts: 3,
            reclaim_count: 0,
            retry_at: None,
            encoder_attempt: 0,
            artifact_path: None,
            upload_url: None,
            qa_state: QaState::None,
            approval_state: ApprovalState::None,
            publish_state: PublishState::None,
            published_at: None,
            ttl_expires_at: None,
            artifact_purged_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_render_completion_enters_qa() {
        let job = job_at(Stage::Render, JobStatus::Running);
        let out = StageOutput::artifact("/out/render.mp4", 1);
        let next = advance(
            &job,
            &Outcome::Completed(out),
            &PipelinePolicy::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(next.stage, Stage::Qa);
        assert_eq!(next.status, JobStatus::Pending);
        assert_eq!(next.encoder_attempt, 1);
        assert!(next.owner.is_none());
        assert_eq!(Phase::of(&next).to_string(), "qa:pending");
    }

    #[test]
    fn test_qa_pass_records_verdict() {
        let job = job_at(Stage::Qa, JobStatus::Running);
        let next = advance(
            &job,
            &Outcome::Completed(StageOutput::empty()),
            &PipelinePolicy::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(next.stage, Stage::Upload);
        assert_eq!(next.qa_state, QaState::Passed);
    }

    #[test]
    fn test_qa_verdict_failure_is_terminal() {
        let job = job_at(Stage::Qa, JobStatus::Running);
        let next = advance(
            &job,
            &Outcome::fatal("audio stream missing"),
            &PipelinePolicy::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(next.status, JobStatus::FailedPermanent);
        assert_eq!(next.qa_state, QaState::Failed);
        assert_eq!(Phase::of(&next).to_string(), "qa:failed");
    }

    #[test]
    fn test_completion_requires_running() {
        let job = job_at(Stage::Render, JobStatus::Pending);
        let err = advance(
            &job,
            &Outcome::Completed(StageOutput::empty()),
            &PipelinePolicy::default(),
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err.from.to_string(), "render:pending");
    }

    #[test]
    fn test_retry_then_permanent_failure() {
        let policy = PipelinePolicy::default().with_retry(RetryPolicy::fixed(Duration::from_secs(300)));
        let now = Utc::now();
        let mut job = job_at(Stage::Upload, JobStatus::Running);

        for expected in 1..3 {
            let next = advance(&job, &Outcome::retryable("quota"), &policy, now).unwrap();
            assert_eq!(next.status, JobStatus::Retrying);
            assert_eq!(next.attempt_count, expected);
            assert_eq!(next.retry_at, Some(now + ChronoDuration::seconds(300)));
            job = next;
            job.status = JobStatus::Running;
        }

        let last = advance(&job, &Outcome::retryable("quota"), &policy, now).unwrap();
        assert_eq!(last.status, JobStatus::FailedPermanent);
        assert_eq!(last.attempt_count, 3);
        assert_eq!(last.error_message.as_deref(), Some("quota"));
        assert!(last.retry_at.is_none());
    }

    #[test]
    fn test_approval_only_from_pending_approval() {
        let policy = PipelinePolicy::default();
        let uploading = job_at(Stage::Upload, JobStatus::Running);
        assert!(advance(&uploading, &Outcome::Approve, &policy, Utc::now()).is_err());

        let mut waiting = job_at(Stage::Approval, JobStatus::Pending);
        waiting.approval_state = ApprovalState::Pending;
        let next = advance(&waiting, &Outcome::Approve, &policy, Utc::now()).unwrap();
        assert_eq!(next.stage, Stage::Publish);
        assert_eq!(next.approval_state, ApprovalState::Approved);
        assert_eq!(next.publish_state, PublishState::Pending);
    }

    #[test]
    fn test_reject_is_terminal() {
        let mut waiting = job_at(Stage::Approval, JobStatus::Pending);
        waiting.approval_state = ApprovalState::Pending;
        let next = advance(
            &waiting,
            &Outcome::Reject {
                reason: Some("wrong cover".to_string()),
            },
            &PipelinePolicy::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(next.status, JobStatus::Done);
        assert_eq!(Phase::of(&next).to_string(), "approval:rejected");
        assert!(advance(&next, &Outcome::Approve, &PipelinePolicy::default(), Utc::now()).is_err());
    }

    #[test]
    fn test_mark_published_sets_ttl() {
        let policy = PipelinePolicy::default().with_artifact_ttl(Duration::from_secs(3600));
        let now = Utc::now();
        let job = job_at(Stage::Publish, JobStatus::Pending);
        let next = advance(&job, &Outcome::MarkPublished, &policy, now).unwrap();
        assert_eq!(next.stage, Stage::Cleanup);
        assert_eq!(next.publish_state, PublishState::Published);
        assert_eq!(next.published_at, Some(now));
        assert_eq!(next.ttl_expires_at, Some(now + ChronoDuration::hours(1)));
    }

    #[test]
    fn test_cleanup_completion_is_done() {
        let job = job_at(Stage::Cleanup, JobStatus::Running);
        let next = advance(
            &job,
            &Outcome::Completed(StageOutput::empty()),
            &PipelinePolicy::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(next.status, JobStatus::Done);
        assert_eq!(Phase::of(&next).to_string(), "cleanup:done");
    }

    #[test]
    fn test_authorize_separates_workers_and_operators() {
        let running = job_at(Stage::Publish, JobStatus::Running);
        let err = authorize(&running, &Actor::operator("bot"), &Outcome::MarkPublished).unwrap_err();
        assert_eq!(err.to_string(), "invalid transition publish:running -> publish:done");
        assert!(authorize(
            &running,
            &Actor::worker("w1"),
            &Outcome::Completed(StageOutput::empty())
        )
        .is_ok());

        let waiting = job_at(Stage::Publish, JobStatus::Pending);
        assert!(authorize(&waiting, &Actor::operator("bot"), &Outcome::MarkPublished).is_ok());
        assert!(authorize(&waiting, &Actor::worker("w1"), &Outcome::MarkPublished).is_err());
        assert!(authorize(
            &waiting,
            &Actor::operator("bot"),
            &Outcome::Completed(StageOutput::empty())
        )
        .is_err());
    }
}
