//! Shell-script stand-in for the ffmpeg program.

use crate::render::{CommandSpec, EncoderProfile, RenderProgram, RenderRequest};

/// Runs `/bin/sh -c <script>` instead of ffmpeg.
///
/// The primary script runs for hardware encoder profiles and the fallback
/// script for software ones. Scripts see `$OUT`, `$IMAGE`, `$AUDIO` and
/// `$CODEC` in their environment.
#[derive(Debug, Clone)]
pub struct ScriptProgram {
    primary: String,
    fallback: String,
}

impl ScriptProgram {
    pub fn new(primary: impl Into<String>, fallback: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            fallback: fallback.into(),
        }
    }

    /// Both encoders write `bytes` zero bytes to the output and exit cleanly.
    pub fn writing(bytes: usize) -> Self {
        let script = format!(r#"head -c {} /dev/zero > "$OUT""#, bytes);
        Self::new(script.clone(), script)
    }
}

impl RenderProgram for ScriptProgram {
    fn build(&self, request: &RenderRequest, encoder: &EncoderProfile) -> CommandSpec {
        let script = if encoder.hardware {
            &self.primary
        } else {
            &self.fallback
        };
        CommandSpec::new("/bin/sh")
            .arg("-c")
            .arg(script.as_str())
            .env("OUT", request.output.to_string_lossy())
            .env("IMAGE", request.image.to_string_lossy())
            .env("AUDIO", request.audio.to_string_lossy())
            .env("CODEC", encoder.codec.as_str())
    }
}
