//! On-disk layout of per-job working files.

use std::path::{Path, PathBuf};

use crate::job::JobId;

/// File name of the rendered artifact inside a job's outbox.
pub const ARTIFACT_FILE_NAME: &str = "render.mp4";

/// File name of the import manifest inside a job's workspace.
pub const INPUTS_MANIFEST_FILE_NAME: &str = "inputs.json";

/// Paths under the storage root.
///
/// ```text
/// <root>/workspace/job_<id>/          imported inputs + inputs.json
/// <root>/outbox/job_<id>/render.mp4   render artifact
/// <root>/logs/job_<id>/job.log        lifecycle log
/// <root>/logs/job_<id>/render-<n>-<encoder>.log
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join("workspace").join(format!("job_{}", job_id))
    }

    /// JSON description of the imported inputs.
    pub fn inputs_manifest(&self, job_id: JobId) -> PathBuf {
        self.workspace_dir(job_id).join(INPUTS_MANIFEST_FILE_NAME)
    }

    pub fn outbox_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join("outbox").join(format!("job_{}", job_id))
    }

    pub fn artifact_path(&self, job_id: JobId) -> PathBuf {
        self.outbox_dir(job_id).join(ARTIFACT_FILE_NAME)
    }

    pub fn logs_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join("logs").join(format!("job_{}", job_id))
    }

    pub fn job_log(&self, job_id: JobId) -> PathBuf {
        self.logs_dir(job_id).join("job.log")
    }

    pub fn attempt_log(&self, job_id: JobId, attempt_no: u32, encoder: &str) -> PathBuf {
        self.logs_dir(job_id)
            .join(format!("render-{}-{}.log", attempt_no, encoder))
    }
}
