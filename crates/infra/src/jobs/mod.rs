//! Asynchronous recording-to-diagnosis jobs.
//!
//! - `Job`: one upload's lifecycle (`pending → processing → processed | failed`)
//! - `JobStore`: persistence and the pending queue (in-memory or filesystem)
//! - `JobProcessor` / `WorkerPool`: claim jobs and run inference off the request path
//! - `JobNotifier`: wakes idle workers when a job is queued

pub mod fs_store;
pub mod notify;
pub mod store;
pub mod types;
pub mod worker;

pub use fs_store::FsJobStore;
pub use notify::JobNotifier;
pub use store::{InMemoryJobStore, JobFilter, JobStats, JobStore, JobStoreError};
pub use types::{INTERRUPTED_MESSAGE, Job, JobState, JobTransition, RecordingMeta, StateChange};
pub use worker::{
    JobFailure, JobProcessor, WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats,
};
