//! Testing utilities and mock implementations for end-to-end tests.
//!
//! Mocks stand in for the external collaborators of each stage, and
//! [`ScriptProgram`] replaces ffmpeg with small shell scripts so render
//! supervision can be exercised without media tooling.
//!
//! # Example
//!
//! ```rust,ignore
//! use pressline_core::testing::{MockInputFetcher, MockUploader, ScriptProgram};
//!
//! let fetcher = MockInputFetcher::new();
//! let uploader = MockUploader::new();
//! let program = ScriptProgram::writing(4096);
//!
//! // Wire them into handlers and run the worker loops...
//! ```

mod mock_fetcher;
mod mock_qa;
mod mock_uploader;
mod script_program;

pub use mock_fetcher::MockInputFetcher;
pub use mock_qa::MockQaCheck;
pub use mock_uploader::{MockPublisher, MockUploader, RecordedUpload};
pub use script_program::ScriptProgram;

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::path::{Path, PathBuf};

    use chrono::Utc;

    use crate::job::{
        ApprovalState, EnqueueRequest, Job, JobId, JobStatus, PublishState, QaState,
        ReleaseMetadata, Stage,
    };
    use crate::layout::StorageLayout;
    use crate::render::{cpu_profile, EncoderPlan, EncoderProfile};
    use crate::worker::FetchedInputs;

    /// Writes a placeholder cover and audio track under `dir/src`.
    pub fn write_inputs(dir: &Path) -> (PathBuf, PathBuf) {
        let src = dir.join("src");
        std::fs::create_dir_all(&src).expect("create input dir");
        let image = src.join("cover.png");
        let audio = src.join("track.wav");
        std::fs::write(&image, b"png").expect("write image");
        std::fs::write(&audio, b"wav").expect("write audio");
        (image, audio)
    }

    /// Release metadata pointing at the given inputs.
    pub fn metadata(title: &str, image: impl AsRef<Path>, audio: impl AsRef<Path>) -> ReleaseMetadata {
        ReleaseMetadata::new(title)
            .with_image(image.as_ref())
            .with_audio(audio.as_ref())
            .with_expected_duration(10.0)
    }

    /// An enqueue request for `channel/release` with inputs under `dir/src`.
    pub fn enqueue_request(dir: &Path, channel: &str, release: &str) -> EnqueueRequest {
        let (image, audio) = write_inputs(dir);
        EnqueueRequest::new(channel, release, metadata(release, image, audio))
    }

    /// An in-memory job at `import:pending`. Never stored.
    pub fn job_with_inputs(id: JobId, image: impl AsRef<Path>, audio: impl AsRef<Path>) -> Job {
        let now = Utc::now();
        Job {
            id,
            channel_slug: "test-channel".to_string(),
            release_ref: format!("release-{}", id),
            metadata: metadata("Test Release", image, audio),
            stage: Stage::Import,
            status: JobStatus::Pending,
            owner: None,
            lease_expires_at: None,
            attempt_count: 0,
            max_attempts: 3,
            reclaim_count: 0,
            retry_at: None,
            encoder_attempt: 0,
            artifact_path: None,
            upload_url: None,
            qa_state: QaState::None,
            approval_state: ApprovalState::None,
            publish_state: PublishState::None,
            published_at: None,
            ttl_expires_at: None,
            artifact_purged_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Lays out imported inputs and the manifest, as the import stage would.
    pub fn write_manifest(layout: &StorageLayout, job_id: JobId) -> FetchedInputs {
        let workspace = layout.workspace_dir(job_id);
        std::fs::create_dir_all(&workspace).expect("create workspace");
        let inputs = FetchedInputs {
            image: workspace.join("cover.png"),
            audio: workspace.join("audio.wav"),
            expected_duration_secs: Some(10.0),
        };
        std::fs::write(&inputs.image, b"png").expect("write image");
        std::fs::write(&inputs.audio, b"wav").expect("write audio");
        std::fs::write(
            layout.inputs_manifest(job_id),
            serde_json::to_vec(&inputs).expect("serialize manifest"),
        )
        .expect("write manifest");
        inputs
    }

    /// A fake hardware encoder followed by the real software profile.
    ///
    /// Pairs with [`ScriptProgram`](super::ScriptProgram), which picks its
    /// script by the profile's `hardware` flag.
    pub fn test_encoders() -> EncoderPlan {
        let primary = EncoderProfile {
            codec: "fakehw".to_string(),
            args: Vec::new(),
            hardware: true,
        };
        EncoderPlan::new(primary, cpu_profile())
    }
}
