//! Read side of the job pipeline: status and result lookups.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use neuroscreen_ai::InferenceResult;
use neuroscreen_core::JobId;

use crate::jobs::{Job, JobFilter, JobState, JobStats, JobStore, JobStoreError, StateChange};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// The job has not reached a terminal state yet.
    #[error("job {job_id} is {state}; no result yet")]
    NotReady { job_id: JobId, state: JobState },
    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: JobId, message: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for QueryError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::NotFound(id) => QueryError::NotFound(id),
            other => QueryError::Storage(other.to_string()),
        }
    }
}

/// Status of a job as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StateChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id(),
            state: job.state(),
            created_at: job.created_at(),
            updated_at: job.updated_at(),
            history: job.history().to_vec(),
            error_message: job.error_message().map(str::to_string),
        }
    }
}

#[derive(Clone)]
pub struct JobQueries {
    jobs: Arc<dyn JobStore>,
}

impl JobQueries {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    pub fn get_job(&self, job_id: JobId) -> Result<Job, QueryError> {
        self.jobs.get(job_id)?.ok_or(QueryError::NotFound(job_id))
    }

    pub fn get_status(&self, job_id: JobId) -> Result<JobStatusView, QueryError> {
        Ok(JobStatusView::from(&self.get_job(job_id)?))
    }

    /// The diagnosis of a `processed` job.
    pub fn get_result(&self, job_id: JobId) -> Result<InferenceResult, QueryError> {
        let job = self.get_job(job_id)?;
        match job.state() {
            JobState::Processed => job
                .result()
                .cloned()
                .ok_or_else(|| QueryError::Storage(format!("job {job_id} is processed without a result"))),
            JobState::Failed => Err(QueryError::JobFailed {
                job_id,
                message: job.error_message().unwrap_or_default().to_string(),
            }),
            state => Err(QueryError::NotReady { job_id, state }),
        }
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, QueryError> {
        Ok(self.jobs.list(filter)?)
    }

    pub fn stats(&self) -> Result<JobStats, QueryError> {
        Ok(self.jobs.stats()?)
    }
}
