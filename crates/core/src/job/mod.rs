//! Durable job records and the claim/transition protocol.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteJobStore;
pub(crate) use sqlite_store::{configure_connection, db_err, from_ms, to_ms};
pub use store::{EnqueueRequest, JobError, JobFilter, JobStore};
pub use types::{
    Actor, ApprovalState, Job, JobId, JobStatus, Outcome, PublishState, QaState, ReleaseMetadata,
    Stage, StageOutput,
};
