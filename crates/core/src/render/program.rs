//! Building the render command line.

use regex_lite::Regex;

use super::config::RenderConfig;
use super::types::{CommandSpec, EncoderProfile, RenderRequest};

const VIDEO_WIDTH: u32 = 1920;
const VIDEO_HEIGHT: u32 = 1080;

/// Turns a render request into a concrete process invocation.
pub trait RenderProgram: Send + Sync {
    fn build(&self, request: &RenderRequest, encoder: &EncoderProfile) -> CommandSpec;
}

/// Renders a still cover image over an audio track into an MP4.
pub struct FfmpegProgram {
    config: RenderConfig,
}

impl FfmpegProgram {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }
}

impl RenderProgram for FfmpegProgram {
    fn build(&self, request: &RenderRequest, encoder: &EncoderProfile) -> CommandSpec {
        let config = &self.config;
        let scale = format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,format=yuv420p",
            w = VIDEO_WIDTH,
            h = VIDEO_HEIGHT
        );

        let mut spec = CommandSpec::new(&config.ffmpeg_path)
            .args(["-y", "-hide_banner"])
            .arg(if config.stats { "-stats" } else { "-nostats" })
            .args(["-loglevel", config.ffmpeg_log_level.as_str()])
            .args(["-progress", "pipe:1"]);

        if config.threads > 0 {
            spec = spec.args(["-threads".to_string(), config.threads.to_string()]);
        }

        spec = spec
            .args(["-loop", "1", "-i"])
            .arg(request.image.to_string_lossy())
            .arg("-i")
            .arg(request.audio.to_string_lossy())
            .args(["-map", "0:v:0", "-map", "1:a:0", "-vf"])
            .arg(scale)
            .args(["-r", "2", "-c:v"])
            .arg(encoder.codec.as_str())
            .args(encoder.args.iter().cloned())
            .args(["-c:a", "aac", "-b:a", "192k", "-shortest"])
            .args(["-movflags", "+faststart"]);

        if config.unbuffered_output {
            spec = spec.args(["-flush_packets", "1"]);
        }

        spec.arg(request.output.to_string_lossy())
    }
}

/// Parses `-progress` key/value output into a completion percentage.
pub struct ProgressParser {
    out_time: Option<Regex>,
    expected_secs: Option<f64>,
    current_secs: f64,
}

impl ProgressParser {
    pub fn new(expected_secs: Option<f64>) -> Self {
        Self {
            // Despite the name, ffmpeg reports out_time_ms in microseconds.
            out_time: Regex::new(r"^out_time_(?:ms|us)=(\d+)").ok(),
            expected_secs: expected_secs.filter(|d| *d > 0.0),
            current_secs: 0.0,
        }
    }

    /// Feed one line. Returns the new percentage when the line carried a timestamp.
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let caps = self.out_time.as_ref()?.captures(line.trim())?;
        let micros: f64 = caps.get(1)?.as_str().parse().ok()?;
        self.current_secs = micros / 1_000_000.0;
        let expected = self.expected_secs?;
        Some((self.current_secs / expected * 100.0).min(100.0))
    }

    pub fn current_secs(&self) -> f64 {
        self.current_secs
    }
}

/// `12.5 %` style progress line.
pub fn format_percent(percent: f64) -> String {
    format!("{:.1} %", percent)
}
