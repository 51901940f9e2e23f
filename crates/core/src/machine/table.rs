//! The stage transition table.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::job::{ApprovalState, Job, JobStatus, QaState, Stage};

/// Sub-status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Pending,
    Running,
    Done,
    Passed,
    Failed,
    Approved,
    Rejected,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Pending => "pending",
            Step::Running => "running",
            Step::Done => "done",
            Step::Passed => "passed",
            Step::Failed => "failed",
            Step::Approved => "approved",
            Step::Rejected => "rejected",
        }
    }
}

/// A stage paired with its sub-status, written `stage:step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Phase {
    pub stage: Stage,
    pub step: Step,
}

impl Phase {
    pub const fn new(stage: Stage, step: Step) -> Self {
        Self { stage, step }
    }

    /// Where a persisted job currently sits.
    pub fn of(job: &Job) -> Self {
        let step = match job.status {
            JobStatus::Pending | JobStatus::Retrying => Step::Pending,
            JobStatus::Claimed | JobStatus::Running => Step::Running,
            JobStatus::FailedPermanent => Step::Failed,
            JobStatus::Done => match (job.stage, job.approval_state, job.qa_state) {
                (Stage::Approval, ApprovalState::Rejected, _) => Step::Rejected,
                (Stage::Qa, _, QaState::Failed) => Step::Failed,
                _ => Step::Done,
            },
        };
        Self::new(job.stage, step)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stage, self.step.as_str())
    }
}

/// A requested hop that is not in the table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub from: Phase,
    pub to: Phase,
}

const fn p(stage: Stage, step: Step) -> Phase {
    Phase::new(stage, step)
}

use Stage::{Approval, Cleanup, Import, Publish, Qa, Render, Upload};
use Step::{Approved, Done, Failed, Passed, Pending, Rejected, Running};

/// Every permitted hop. Anything absent is rejected.
pub const TRANSITIONS: &[(Phase, Phase)] = &[
    // import
    (p(Import, Pending), p(Import, Running)),
    (p(Import, Running), p(Import, Pending)),
    (p(Import, Running), p(Import, Done)),
    (p(Import, Running), p(Import, Failed)),
    (p(Import, Done), p(Render, Pending)),
    // render
    (p(Render, Pending), p(Render, Running)),
    (p(Render, Running), p(Render, Pending)),
    (p(Render, Running), p(Render, Done)),
    (p(Render, Running), p(Render, Failed)),
    (p(Render, Done), p(Qa, Pending)),
    // qa
    (p(Qa, Pending), p(Qa, Running)),
    (p(Qa, Running), p(Qa, Pending)),
    (p(Qa, Running), p(Qa, Passed)),
    (p(Qa, Running), p(Qa, Failed)),
    (p(Qa, Passed), p(Upload, Pending)),
    // upload
    (p(Upload, Pending), p(Upload, Running)),
    (p(Upload, Running), p(Upload, Pending)),
    (p(Upload, Running), p(Upload, Done)),
    (p(Upload, Running), p(Upload, Failed)),
    (p(Upload, Done), p(Approval, Pending)),
    // approval: operator driven only
    (p(Approval, Pending), p(Approval, Approved)),
    (p(Approval, Pending), p(Approval, Rejected)),
    (p(Approval, Approved), p(Publish, Pending)),
    // publish: a publish worker or an operator confirmation
    (p(Publish, Pending), p(Publish, Running)),
    (p(Publish, Pending), p(Publish, Done)),
    (p(Publish, Running), p(Publish, Pending)),
    (p(Publish, Running), p(Publish, Done)),
    (p(Publish, Running), p(Publish, Failed)),
    (p(Publish, Done), p(Cleanup, Pending)),
    // cleanup
    (p(Cleanup, Pending), p(Cleanup, Running)),
    (p(Cleanup, Running), p(Cleanup, Pending)),
    (p(Cleanup, Running), p(Cleanup, Done)),
    (p(Cleanup, Running), p(Cleanup, Failed)),
];

/// Whether `to` is an immediate successor of `from`.
pub fn is_allowed(from: Phase, to: Phase) -> bool {
    TRANSITIONS.iter().any(|&(f, t)| f == from && t == to)
}

/// Rejects any hop that is not listed in [`TRANSITIONS`].
pub fn check(from: Phase, to: Phase) -> Result<(), TransitionError> {
    if is_allowed(from, to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

/// Validates every hop of a multi-step path.
pub fn check_path(path: &[Phase]) -> Result<(), TransitionError> {
    for hop in path.windows(2) {
        check(hop[0], hop[1])?;
    }
    Ok(())
}
