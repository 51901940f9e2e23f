//! Configuration for the render supervisor.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Watchdog thresholds, encoder switches and ffmpeg knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Seconds after launch before the watchdog may declare a stall.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: f64,

    /// Seconds without output growth before the process is considered stuck.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: f64,

    /// Minimum byte growth that counts as progress.
    #[serde(default = "default_min_growth")]
    pub min_growth_bytes: u64,

    /// Seconds between SIGTERM and a forced kill.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: f64,

    /// How often the output size is sampled (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Smallest artifact accepted as a real render.
    #[serde(default = "default_min_artifact")]
    pub min_artifact_bytes: u64,

    /// Skip hardware encoder detection and render on the CPU only.
    #[serde(default)]
    pub force_cpu_encoder: bool,

    /// Echo every stderr line of the render process into the tracing log.
    #[serde(default = "default_true")]
    pub echo_stderr: bool,

    /// Ask ffmpeg to flush packets as they are muxed, so the artifact grows steadily.
    #[serde(default)]
    pub unbuffered_output: bool,

    /// Let ffmpeg print its periodic stats line to stderr.
    #[serde(default)]
    pub stats: bool,

    /// Validate the artifact's streams with ffprobe after a clean exit.
    #[serde(default = "default_true")]
    pub probe_artifact: bool,

    /// Path to ffmpeg binary.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// Path to ffprobe binary.
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,

    /// FFmpeg log level (quiet, panic, fatal, error, warning, info, verbose, debug, trace).
    #[serde(default = "default_log_level")]
    pub ffmpeg_log_level: String,

    /// Encoder threads (0 = let ffmpeg decide).
    #[serde(default)]
    pub threads: u32,
}

fn default_grace_period() -> f64 {
    30.0
}

fn default_idle_threshold() -> f64 {
    120.0
}

fn default_min_growth() -> u64 {
    1024
}

fn default_kill_grace() -> f64 {
    15.0
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_min_artifact() -> u64 {
    1024
}

fn default_true() -> bool {
    true
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_log_level() -> String {
    "error".to_string()
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
            idle_threshold_secs: default_idle_threshold(),
            min_growth_bytes: default_min_growth(),
            kill_grace_secs: default_kill_grace(),
            poll_interval_ms: default_poll_interval(),
            min_artifact_bytes: default_min_artifact(),
            force_cpu_encoder: false,
            echo_stderr: true,
            unbuffered_output: false,
            stats: false,
            probe_artifact: true,
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            ffmpeg_log_level: default_log_level(),
            threads: 0,
        }
    }
}

fn secs(value: f64, floor: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(floor)).unwrap_or(Duration::MAX)
}

impl RenderConfig {
    /// Grace period, never negative.
    pub fn grace_period(&self) -> Duration {
        secs(self.grace_period_secs, 0.0)
    }

    /// Idle threshold, at least one second.
    pub fn idle_threshold(&self) -> Duration {
        secs(self.idle_threshold_secs, 1.0)
    }

    pub fn kill_grace(&self) -> Duration {
        secs(self.kill_grace_secs, 0.0)
    }

    /// Growth threshold, at least one byte.
    pub fn min_growth(&self) -> u64 {
        self.min_growth_bytes.max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn with_watchdog(mut self, grace_secs: f64, idle_secs: f64, kill_grace_secs: f64) -> Self {
        self.grace_period_secs = grace_secs;
        self.idle_threshold_secs = idle_secs;
        self.kill_grace_secs = kill_grace_secs;
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_min_artifact_bytes(mut self, bytes: u64) -> Self {
        self.min_artifact_bytes = bytes;
        self
    }

    pub fn with_force_cpu(mut self, force: bool) -> Self {
        self.force_cpu_encoder = force;
        self
    }
}
