//! Worker processes: one role, one stage, one job at a time.

mod collaborators;
mod config;
mod handler;
pub mod handlers;
mod lease;
mod runner;
mod traits;
mod types;

pub use collaborators::{DryRunUploader, LocalInputFetcher, ProbeQaCheck};
pub use config::WorkerConfig;
pub use handler::{Handler, HandlerTable, RoleHandler};
pub use handlers::{
    CleanupHandler, ImportHandler, PublishHandler, QaHandler, RenderHandler, UploadHandler,
};
pub use lease::LeaseKeeper;
pub use runner::{Processed, WorkerLoop};
pub use traits::{
    CollaboratorError, FetchedInputs, InputFetcher, Publisher, QaCheck, QaVerdict, Uploader,
};
pub use types::{Role, WorkerError};
