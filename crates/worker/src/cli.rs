use std::path::PathBuf;

use clap::{Parser, Subcommand};

use pressline_core::{JobId, Role};

#[derive(Parser, Debug)]
#[command(author, version, about = "Media release pipeline worker and admin tool", long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(long, env = "PRESSLINE_CONFIG", default_value = "pressline.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a worker for one role
    Worker {
        /// import, render, qa, upload, publish or cleanup
        #[arg(long)]
        role: Role,
        /// Process at most one job and exit
        #[arg(long)]
        once: bool,
    },

    /// Periodically purge artifacts whose retention expired
    Reaper {
        /// Sweep once and exit
        #[arg(long)]
        once: bool,
    },

    /// Create a job for a release
    Enqueue {
        channel: String,
        release_ref: String,
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        audio: PathBuf,
        #[arg(long)]
        title: Option<String>,
        /// Expected video duration in seconds
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Approve an uploaded video
    Approve {
        job_id: JobId,
        #[arg(long, env = "USER", default_value = "cli")]
        operator: String,
    },

    /// Reject an uploaded video
    Reject {
        job_id: JobId,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long, env = "USER", default_value = "cli")]
        operator: String,
    },

    /// Confirm that a video is live
    Publish {
        job_id: JobId,
        #[arg(long, env = "USER", default_value = "cli")]
        operator: String,
    },

    /// Fail a job permanently
    Cancel {
        job_id: JobId,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Clear a stuck lease so the job can be claimed again
    Unlock { job_id: JobId },

    /// Print a JSON snapshot of jobs and workers
    Status {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_worker() {
        let cli = Cli::try_parse_from(["pressline", "worker", "--role", "render", "--once"]).unwrap();
        match cli.command {
            Command::Worker { role, once } => {
                assert_eq!(role, Role::Render);
                assert!(once);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_approval_role() {
        assert!(Cli::try_parse_from(["pressline", "worker", "--role", "approval"]).is_err());
    }

    #[test]
    fn test_parse_reject_with_reason() {
        let cli = Cli::try_parse_from([
            "pressline",
            "--config",
            "/etc/pressline.toml",
            "reject",
            "42",
            "--reason",
            "wrong cover",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/pressline.toml"));
        match cli.command {
            Command::Reject { job_id, reason, .. } => {
                assert_eq!(job_id, 42);
                assert_eq!(reason.as_deref(), Some("wrong cover"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
