//! Core job types and the job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use neuroscreen_ai::{FileFormat, InferenceResult};
use neuroscreen_core::{JobId, RecordingId, SubjectRef};

use super::store::JobStoreError;

/// Message recorded on jobs found mid-flight after a restart.
pub const INTERRUPTED_MESSAGE: &str = "processing was interrupted";

/// Lifecycle state of a job.
///
/// `pending → processing → {processed | failed}`; terminal states have no
/// outgoing transitions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created and queued, not yet claimed by a worker
    Pending,
    /// Claimed by a worker, inference running
    Processing,
    /// Inference succeeded; result attached
    Processed,
    /// Some step failed; error message attached
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Processed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Processed => "processed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "processed" => Ok(JobState::Processed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A requested state change, carrying the terminal payload when there is one.
#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    /// `pending → processing`
    Start,
    /// `processing → processed`
    Complete(InferenceResult),
    /// `processing → failed`, with a user-safe message
    Fail(String),
}

impl JobTransition {
    pub fn target(&self) -> JobState {
        match self {
            JobTransition::Start => JobState::Processing,
            JobTransition::Complete(_) => JobState::Processed,
            JobTransition::Fail(_) => JobState::Failed,
        }
    }
}

/// One entry of a job's state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

/// What was uploaded for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMeta {
    pub recording_id: RecordingId,
    pub file_name: Option<String>,
    pub file_format: FileFormat,
    pub file_size_bytes: u64,
    pub channel_count: usize,
    pub sample_count: usize,
}

/// One tracked unit of asynchronous recording-to-diagnosis work.
///
/// Fields are private so the state machine is the only way to change them:
/// `result` is set only when `processed`, `error_message` only when `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    subject_reference: SubjectRef,
    recording: RecordingMeta,
    state: JobState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    processing_time_ms: Option<u64>,
    result: Option<InferenceResult>,
    error_message: Option<String>,
    history: Vec<StateChange>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        subject_reference: SubjectRef,
        recording: RecordingMeta,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            subject_reference,
            recording,
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            processing_time_ms: None,
            result: None,
            error_message: None,
            history: vec![StateChange {
                state: JobState::Pending,
                at: now,
            }],
        }
    }

    /// Apply a transition, enforcing the state machine.
    ///
    /// On error the job is left untouched.
    pub(crate) fn apply(
        &mut self,
        transition: JobTransition,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let to = transition.target();
        let allowed = matches!(
            (self.state, to),
            (JobState::Pending, JobState::Processing)
                | (JobState::Processing, JobState::Processed)
                | (JobState::Processing, JobState::Failed)
        );
        if !allowed {
            return Err(JobStoreError::InvalidTransition {
                job_id: self.id,
                from: self.state,
                to,
            });
        }

        match transition {
            JobTransition::Start => {
                self.started_at = Some(now);
            }
            JobTransition::Complete(result) => {
                self.result = Some(result);
                self.finish(now);
            }
            JobTransition::Fail(message) => {
                self.error_message = Some(message);
                self.finish(now);
            }
        }

        self.state = to;
        self.updated_at = now;
        self.history.push(StateChange { state: to, at: now });
        Ok(())
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.finished_at = Some(now);
        self.processing_time_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64);
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn subject_reference(&self) -> &SubjectRef {
        &self.subject_reference
    }

    pub fn recording(&self) -> &RecordingMeta {
        &self.recording
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn processing_time_ms(&self) -> Option<u64> {
        self.processing_time_ms
    }

    pub fn result(&self) -> Option<&InferenceResult> {
        self.result.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }
}
