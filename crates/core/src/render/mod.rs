//! Render process supervision.
//!
//! A render runs as an external process writing one artifact. The supervisor
//! samples the artifact size, terminates processes that stop producing output,
//! and retries once with the software encoder before giving up.

mod config;
mod encoder;
mod error;
mod probe;
mod program;
mod supervisor;
mod types;
mod watchdog;

pub use config::RenderConfig;
pub use encoder::{
    cpu_profile, detect_hardware_encoder, hardware_profile, pick_hardware_codec, EncoderPlan,
    HARDWARE_CODECS,
};
pub use error::RenderError;
pub use probe::{ArtifactInfo, ArtifactProbe, FfprobeProbe, SizeProbe};
pub use program::{format_percent, FfmpegProgram, ProgressParser, RenderProgram};
pub use supervisor::RenderSupervisor;
pub use types::{
    AttemptOutcome, CommandSpec, EncoderKind, EncoderProfile, RenderAttempt, RenderReport,
    RenderRequest,
};
pub use watchdog::{growth_paths, observed_bytes, OutputGrowthWatchdog};
