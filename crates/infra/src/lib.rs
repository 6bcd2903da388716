//! `neuroscreen-infra`
//!
//! **Responsibility:** job lifecycle and everything around it: stores,
//! dispatching uploads, background workers, read queries and configuration.

pub mod config;
pub mod dispatcher;
pub mod jobs;
pub mod pipeline;
pub mod queries;
pub mod recordings;

pub use config::{ConfigError, PipelineConfig};
pub use dispatcher::{AsyncDispatcher, RemoveError, SubmitError};
pub use pipeline::{Pipeline, PipelineError};
pub use queries::{JobQueries, JobStatusView, QueryError};
pub use recordings::{FsRecordingStore, InMemoryRecordingStore, RecordingStore, RecordingStoreError};
