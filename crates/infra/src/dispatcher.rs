//! Accepts uploads and turns them into queued jobs.
//!
//! Everything that can be checked cheaply happens here, synchronously: size,
//! format, structure and shape. Only recordings that pass are stored and
//! queued; the caller never waits for inference.

use std::sync::Arc;

use tracing::{info, warn};

use neuroscreen_ai::{FileFormat, InferenceInput, SignalError, SignalSpec};
use neuroscreen_core::{JobId, SubjectRef};

use crate::jobs::{Job, JobNotifier, JobState, JobStore, JobStoreError, RecordingMeta};
use crate::recordings::RecordingStore;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubmitError {
    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("invalid recording: {0}")]
    Validation(#[from] SignalError),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoveError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} is {state} and cannot be removed")]
    InUse { job_id: JobId, state: JobState },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for RemoveError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::NotFound(id) => RemoveError::NotFound(id),
            JobStoreError::InUse { job_id, state } => RemoveError::InUse { job_id, state },
            other => RemoveError::Storage(other.to_string()),
        }
    }
}

pub struct AsyncDispatcher {
    jobs: Arc<dyn JobStore>,
    recordings: Arc<dyn RecordingStore>,
    notifier: Arc<JobNotifier>,
    signal_spec: SignalSpec,
    max_upload_bytes: usize,
}

impl AsyncDispatcher {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        recordings: Arc<dyn RecordingStore>,
        notifier: Arc<JobNotifier>,
        signal_spec: SignalSpec,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            jobs,
            recordings,
            notifier,
            signal_spec,
            max_upload_bytes,
        }
    }

    pub fn signal_spec(&self) -> SignalSpec {
        self.signal_spec
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Validate an upload and queue a `pending` job for it.
    ///
    /// On error no job exists and nothing is left in the recording store.
    pub fn submit(
        &self,
        bytes: &[u8],
        file_name: Option<&str>,
        subject: SubjectRef,
    ) -> Result<Job, SubmitError> {
        if bytes.len() > self.max_upload_bytes {
            return Err(SubmitError::TooLarge {
                size: bytes.len(),
                limit: self.max_upload_bytes,
            });
        }

        let file_format = FileFormat::detect(file_name, bytes)?;
        let input = InferenceInput::decode(bytes, file_name)?;
        self.signal_spec.validate(&input)?;

        let channel_count = input.channel_count();
        let sample_count = input.sample_count();
        let recording_id = self
            .recordings
            .put(input)
            .map_err(|e| SubmitError::Storage(e.to_string()))?;

        let meta = RecordingMeta {
            recording_id,
            file_name: file_name.map(str::to_string),
            file_format,
            file_size_bytes: bytes.len() as u64,
            channel_count,
            sample_count,
        };

        let job = match self.jobs.create(subject, meta) {
            Ok(job) => job,
            Err(e) => {
                if let Err(cleanup) = self.recordings.delete(recording_id) {
                    warn!(recording_id = %recording_id, error = %cleanup, "failed to remove orphaned recording");
                }
                return Err(SubmitError::Storage(e.to_string()));
            }
        };

        self.notifier.notify_one();
        info!(
            job_id = %job.id(),
            subject = %job.subject_reference(),
            format = file_format.as_str(),
            channels = channel_count,
            samples = sample_count,
            bytes = bytes.len(),
            "recording accepted"
        );
        Ok(job)
    }

    /// Remove a job and its stored recording.
    ///
    /// Recordings are kept until their job is removed; this is the only way
    /// to reclaim them. Jobs being processed cannot be removed.
    pub fn remove(&self, job_id: JobId) -> Result<Job, RemoveError> {
        let job = self.jobs.delete(job_id)?;
        let recording_id = job.recording().recording_id;
        if let Err(e) = self.recordings.delete(recording_id) {
            warn!(job_id = %job_id, recording_id = %recording_id, error = %e, "failed to remove recording of deleted job");
        }
        info!(job_id = %job_id, state = %job.state(), "record removed");
        Ok(job)
    }
}
