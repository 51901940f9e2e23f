//! Types shared by the render supervisor and its collaborators.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Which encoder slot an attempt used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    /// Hardware encoder when one was detected.
    Primary,
    /// Software encoder used for the second attempt.
    Fallback,
}

impl EncoderKind {
    /// Value stored in `jobs.encoder_attempt`.
    pub fn index(&self) -> u8 {
        match self {
            EncoderKind::Primary => 0,
            EncoderKind::Fallback => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderKind::Primary => "primary",
            EncoderKind::Fallback => "fallback",
        }
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A video codec plus the arguments tuned for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderProfile {
    /// ffmpeg codec name, e.g. `h264_nvenc` or `libx264`.
    pub codec: String,
    pub args: Vec<String>,
    pub hardware: bool,
}

/// What to render for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub job_id: JobId,
    pub image: PathBuf,
    pub audio: PathBuf,
    pub output: PathBuf,
    pub expected_duration_secs: Option<f64>,
}

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Shell-like rendering for logs. Arguments containing whitespace are quoted.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(quote(&self.program.to_string_lossy()));
        parts.extend(self.args.iter().map(|a| quote(a)));
        parts.join(" ")
    }
}

fn quote(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
        format!("'{}'", arg.replace('\'', r"'\''"))
    } else {
        arg.to_string()
    }
}

/// How a single render attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    /// Killed by the watchdog after `idle_secs` without output growth.
    Stuck { idle_secs: f64 },
    ExitFailure { code: Option<i32> },
    MissingArtifact,
    InvalidArtifact { reason: String },
    LaunchFailed { reason: String },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Succeeded)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Succeeded => write!(f, "succeeded"),
            AttemptOutcome::Stuck { idle_secs } => {
                write!(f, "stuck (no output growth for {:.1}s)", idle_secs)
            }
            AttemptOutcome::ExitFailure { code: Some(code) } => {
                write!(f, "exited with code {}", code)
            }
            AttemptOutcome::ExitFailure { code: None } => write!(f, "terminated by signal"),
            AttemptOutcome::MissingArtifact => write!(f, "no output artifact"),
            AttemptOutcome::InvalidArtifact { reason } => write!(f, "invalid artifact: {}", reason),
            AttemptOutcome::LaunchFailed { reason } => write!(f, "failed to launch: {}", reason),
        }
    }
}

/// Record of one render attempt, persisted as a JSON line in the job log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderAttempt {
    pub job_id: JobId,
    pub attempt_no: u32,
    pub encoder: EncoderKind,
    pub codec: String,
    pub started_at: DateTime<Utc>,
    pub last_growth_at: Option<DateTime<Utc>>,
    pub observed_output_bytes: u64,
    pub outcome: AttemptOutcome,
    /// Verbatim stderr of the attempt.
    pub log_path: PathBuf,
    /// Last stderr lines, for error messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stderr_tail: Vec<String>,
}

impl RenderAttempt {
    pub fn new(
        job_id: JobId,
        attempt_no: u32,
        encoder: EncoderKind,
        codec: impl Into<String>,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            job_id,
            attempt_no,
            encoder,
            codec: codec.into(),
            started_at: Utc::now(),
            last_growth_at: None,
            observed_output_bytes: 0,
            outcome: AttemptOutcome::LaunchFailed {
                reason: "not started".to_string(),
            },
            log_path: log_path.into(),
            stderr_tail: Vec::new(),
        }
    }

    /// One-line description for error messages.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "attempt {} ({}, {}): {}",
            self.attempt_no, self.encoder, self.codec, self.outcome
        );
        if let Some(last) = self.stderr_tail.last() {
            line.push_str(&format!(" [{}]", last));
        }
        line
    }
}

/// Successful render result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderReport {
    pub job_id: JobId,
    pub output: PathBuf,
    pub encoder: EncoderKind,
    pub codec: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the artifact.
    pub sha256: String,
    pub duration_secs: Option<f64>,
    pub attempts: Vec<RenderAttempt>,
}
