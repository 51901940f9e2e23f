//! Error types for the render module.

use std::path::PathBuf;
use thiserror::Error;

use super::types::RenderAttempt;

#[derive(Debug, Error)]
pub enum RenderError {
    /// Both the primary and the fallback attempt failed.
    #[error("Render failed after {} attempts: {}", .attempts.len(), summarize(.attempts))]
    RenderFailed { attempts: Vec<RenderAttempt> },

    /// The render program could not be started at all.
    #[error("Failed to launch {program}: {reason}")]
    LaunchFailed { program: PathBuf, reason: String },

    /// The artifact could not be inspected or is structurally invalid.
    #[error("Artifact probe failed: {reason}")]
    Probe { reason: String },

    /// An input file the render needs does not exist.
    #[error("Render input not found: {path}")]
    InputNotFound { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn summarize(attempts: &[RenderAttempt]) -> String {
    attempts
        .iter()
        .map(RenderAttempt::summary)
        .collect::<Vec<_>>()
        .join("; ")
}

impl RenderError {
    pub fn probe(reason: impl Into<String>) -> Self {
        Self::Probe {
            reason: reason.into(),
        }
    }

    pub fn launch_failed(program: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::LaunchFailed {
            program: program.into(),
            reason: reason.into(),
        }
    }

    /// Whether a later claim of the same job may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RenderError::RenderFailed { .. } => true,
            RenderError::LaunchFailed { .. } => true,
            RenderError::Probe { .. } => true,
            RenderError::Io(_) => true,
            RenderError::InputNotFound { .. } => false,
        }
    }
}
