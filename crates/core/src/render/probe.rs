//! Structural validation of rendered artifacts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::error::RenderError;

/// What a probe learned about a media file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub size_bytes: u64,
    /// Container name, when the probe understands the format.
    pub format: Option<String>,
    pub duration_secs: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ArtifactInfo {
    pub fn has_video(&self) -> bool {
        self.video_codec.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }
}

/// Inspects a rendered file.
#[async_trait]
pub trait ArtifactProbe: Send + Sync {
    /// Fails with [`RenderError::Probe`] when the file is not a usable video.
    async fn inspect(&self, path: &Path) -> Result<ArtifactInfo, RenderError>;
}

/// Only checks that the file exists; reports its size.
#[derive(Debug, Clone, Default)]
pub struct SizeProbe;

#[async_trait]
impl ArtifactProbe for SizeProbe {
    async fn inspect(&self, path: &Path) -> Result<ArtifactInfo, RenderError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| RenderError::probe(format!("{}: {}", path.display(), e)))?;
        Ok(ArtifactInfo {
            size_bytes: meta.len(),
            ..Default::default()
        })
    }
}

/// Runs ffprobe and requires a parsable container with video and audio.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    ffprobe_path: PathBuf,
}

impl FfprobeProbe {
    pub fn new(ffprobe_path: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }

    /// Parses `ffprobe -print_format json -show_format -show_streams` output.
    pub fn parse_probe_output(output: &str) -> Result<ArtifactInfo, RenderError> {
        #[derive(Deserialize)]
        struct ProbeOutput {
            format: Option<ProbeFormat>,
            #[serde(default)]
            streams: Vec<ProbeStream>,
        }

        #[derive(Deserialize)]
        struct ProbeFormat {
            format_name: Option<String>,
            duration: Option<String>,
            size: Option<String>,
        }

        #[derive(Deserialize)]
        struct ProbeStream {
            codec_type: Option<String>,
            codec_name: Option<String>,
            width: Option<u32>,
            height: Option<u32>,
        }

        let probe: ProbeOutput = serde_json::from_str(output)
            .map_err(|e| RenderError::probe(format!("Failed to parse ffprobe output: {}", e)))?;

        let format = probe
            .format
            .ok_or_else(|| RenderError::probe("ffprobe reported no container format"))?;

        let stream_of = |kind: &str| {
            probe
                .streams
                .iter()
                .find(|s| s.codec_type.as_deref() == Some(kind))
        };
        let video = stream_of("video");
        let audio = stream_of("audio");

        let info = ArtifactInfo {
            size_bytes: format
                .size
                .as_ref()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0),
            format: format
                .format_name
                .as_deref()
                .and_then(|f| f.split(',').next())
                .map(str::to_string),
            duration_secs: format.duration.as_ref().and_then(|d| d.parse::<f64>().ok()),
            video_codec: video.map(|s| s.codec_name.clone().unwrap_or_else(|| "unknown".into())),
            audio_codec: audio.map(|s| s.codec_name.clone().unwrap_or_else(|| "unknown".into())),
            width: video.and_then(|s| s.width),
            height: video.and_then(|s| s.height),
        };

        if !info.has_video() {
            return Err(RenderError::probe("artifact has no video stream"));
        }
        if !info.has_audio() {
            return Err(RenderError::probe("artifact has no audio stream"));
        }
        Ok(info)
    }
}

#[async_trait]
impl ArtifactProbe for FfprobeProbe {
    async fn inspect(&self, path: &Path) -> Result<ArtifactInfo, RenderError> {
        if !path.exists() {
            return Err(RenderError::probe(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| {
                RenderError::launch_failed(&self.ffprobe_path, e.to_string())
            })?;

        if !output.status.success() {
            return Err(RenderError::probe(format!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut info = Self::parse_probe_output(&String::from_utf8_lossy(&output.stdout))?;
        if info.size_bytes == 0 {
            info.size_bytes = tokio::fs::metadata(path).await?.len();
        }
        Ok(info)
    }
}
