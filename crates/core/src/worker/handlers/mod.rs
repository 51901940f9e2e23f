//! One handler per worker role.

mod cleanup;
mod import;
mod qa;
mod render;
mod upload;

pub use cleanup::CleanupHandler;
pub use import::ImportHandler;
pub use qa::QaHandler;
pub use render::RenderHandler;
pub use upload::{PublishHandler, UploadHandler};

use std::path::PathBuf;

use crate::job::Job;
use crate::layout::StorageLayout;

/// The job's recorded artifact, or where the render stage writes it.
pub(crate) fn artifact_of(job: &Job, layout: &StorageLayout) -> PathBuf {
    job.artifact_path
        .clone()
        .unwrap_or_else(|| layout.artifact_path(job.id))
}
