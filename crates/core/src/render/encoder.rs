//! Encoder profiles and hardware detection.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use super::config::RenderConfig;
use super::types::{EncoderKind, EncoderProfile};

/// Hardware H.264 encoders, most preferred first.
pub const HARDWARE_CODECS: [&str; 3] = ["h264_nvenc", "h264_qsv", "h264_amf"];

fn profile(codec: &str, args: &[&str], hardware: bool) -> EncoderProfile {
    EncoderProfile {
        codec: codec.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        hardware,
    }
}

/// Software libx264 profile tuned for a still image.
pub fn cpu_profile() -> EncoderProfile {
    profile(
        "libx264",
        &[
            "-preset",
            "superfast",
            "-crf",
            "28",
            "-tune",
            "stillimage",
            "-profile:v",
            "high",
        ],
        false,
    )
}

/// Profile for a known hardware codec.
pub fn hardware_profile(codec: &str) -> Option<EncoderProfile> {
    match codec {
        "h264_nvenc" => Some(profile(
            codec,
            &[
                "-preset",
                "p5",
                "-rc",
                "vbr",
                "-cq",
                "19",
                "-b:v",
                "0",
                "-profile:v",
                "high",
            ],
            true,
        )),
        "h264_qsv" | "h264_amf" => Some(profile(codec, &["-b:v", "2M"], true)),
        _ => None,
    }
}

/// Picks the preferred hardware codec from `ffmpeg -encoders` output.
pub fn pick_hardware_codec(encoders: &str) -> Option<&'static str> {
    HARDWARE_CODECS.into_iter().find(|codec| {
        encoders
            .lines()
            .any(|line| line.split_whitespace().any(|word| word == *codec))
    })
}

/// Asks ffmpeg which encoders it was built with.
pub async fn detect_hardware_encoder(ffmpeg_path: &Path) -> Option<EncoderProfile> {
    let output = Command::new(ffmpeg_path)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    let stdout = match output {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).to_string(),
        Ok(o) => {
            debug!("ffmpeg -encoders exited with {:?}", o.status.code());
            return None;
        }
        Err(e) => {
            debug!("Failed to run {}: {}", ffmpeg_path.display(), e);
            return None;
        }
    };

    pick_hardware_codec(&stdout).and_then(hardware_profile)
}

/// The encoders used for attempt 1 and attempt 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderPlan {
    pub primary: EncoderProfile,
    pub fallback: EncoderProfile,
}

impl EncoderPlan {
    pub fn new(primary: EncoderProfile, fallback: EncoderProfile) -> Self {
        Self { primary, fallback }
    }

    /// Both attempts on libx264.
    pub fn cpu_only() -> Self {
        Self::new(cpu_profile(), cpu_profile())
    }

    /// Hardware primary when available, libx264 fallback.
    pub async fn detect(config: &RenderConfig) -> Self {
        if config.force_cpu_encoder {
            info!("CPU encoder forced by configuration");
            return Self::cpu_only();
        }
        match detect_hardware_encoder(&config.ffmpeg_path).await {
            Some(hw) => {
                info!("Using hardware encoder {} with libx264 fallback", hw.codec);
                Self::new(hw, cpu_profile())
            }
            None => {
                info!("No hardware encoder found, rendering with libx264");
                Self::cpu_only()
            }
        }
    }

    pub fn profile(&self, kind: EncoderKind) -> &EncoderProfile {
        match kind {
            EncoderKind::Primary => &self.primary,
            EncoderKind::Fallback => &self.fallback,
        }
    }
}
