pub mod config;
pub mod heartbeat;
pub mod job;
pub mod joblog;
pub mod layout;
pub mod machine;
pub mod reaper;
pub mod render;
pub mod status;
pub mod testing;
pub mod worker;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, LogFormat,
    ReaperConfig,
};
pub use heartbeat::{HeartbeatRegistry, SqliteHeartbeatRegistry, WorkerHeartbeat, WorkerState};
pub use job::{
    Actor, EnqueueRequest, Job, JobError, JobFilter, JobId, JobStatus, JobStore, Outcome,
    ReleaseMetadata, SqliteJobStore, Stage, StageOutput,
};
pub use joblog::JobLogs;
pub use layout::StorageLayout;
pub use machine::{Phase, PipelinePolicy, TransitionError};
pub use reaper::{SweepReport, TtlReaper};
pub use render::{RenderConfig, RenderError, RenderReport, RenderSupervisor};
pub use status::{StatusReader, StatusSnapshot};
pub use worker::{CollaboratorError, HandlerTable, Role, RoleHandler, WorkerConfig, WorkerLoop};
