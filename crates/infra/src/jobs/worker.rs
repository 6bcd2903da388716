//! Inference workers.
//!
//! A fixed pool of threads claims pending jobs, runs the classifier and
//! records exactly one terminal state per job. Failures are never retried.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use neuroscreen_ai::{InferenceError, InferenceExecutor, InferenceResult, ModelRegistry};

use super::notify::JobNotifier;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobState, JobTransition};
use crate::recordings::RecordingStore;

pub const MODEL_UNAVAILABLE_MESSAGE: &str =
    "model unavailable: the classification model could not be loaded";
pub const INFERENCE_FAILED_MESSAGE: &str = "inference failed";
pub const RECORDING_UNAVAILABLE_MESSAGE: &str = "recording could not be loaded";
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error";

/// Why a claimed job could not be classified.
///
/// `Display` carries full detail for logs; [`JobFailure::user_message`] is
/// what gets stored on the job and shown to callers.
#[derive(Debug, thiserror::Error)]
pub enum JobFailure {
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("recording {0} not found")]
    RecordingMissing(String),
    #[error("recording storage: {0}")]
    RecordingStorage(String),
    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl JobFailure {
    pub fn user_message(&self) -> String {
        match self {
            JobFailure::Inference(InferenceError::ModelUnavailable(_)) => {
                MODEL_UNAVAILABLE_MESSAGE.to_string()
            }
            JobFailure::Inference(InferenceError::ShapeMismatch { expected, found }) => {
                format!("recording is incompatible with the model: expected {expected}, found {found}")
            }
            JobFailure::Inference(InferenceError::InferenceFailed(_)) => {
                INFERENCE_FAILED_MESSAGE.to_string()
            }
            JobFailure::RecordingMissing(_) | JobFailure::RecordingStorage(_) => {
                RECORDING_UNAVAILABLE_MESSAGE.to_string()
            }
            JobFailure::Panicked(_) => INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs one claimed job to a terminal state.
#[derive(Clone)]
pub struct JobProcessor {
    jobs: Arc<dyn JobStore>,
    recordings: Arc<dyn RecordingStore>,
    registry: Arc<ModelRegistry>,
    executor: InferenceExecutor,
}

impl JobProcessor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        recordings: Arc<dyn RecordingStore>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            jobs,
            recordings,
            registry,
            executor: InferenceExecutor::new(),
        }
    }

    fn classify(&self, job: &Job) -> Result<InferenceResult, JobFailure> {
        let recording_id = job.recording().recording_id;
        let input = self
            .recordings
            .get(recording_id)
            .map_err(|e| JobFailure::RecordingStorage(e.to_string()))?
            .ok_or_else(|| JobFailure::RecordingMissing(recording_id.to_string()))?;
        let model = self.registry.get_model()?;
        Ok(self.executor.run(&input, &model)?)
    }

    /// Classify a job already in `processing` and record the outcome.
    ///
    /// Panics inside the pipeline are contained and recorded as a failure.
    pub fn process(&self, job: &Job) -> Result<Job, JobStoreError> {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.classify(job)))
            .unwrap_or_else(|payload| Err(JobFailure::Panicked(panic_message(payload.as_ref()))));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let transition = match outcome {
            Ok(result) => {
                info!(
                    job_id = %job.id(),
                    label = %result.label,
                    confidence = result.confidence,
                    windows = result.windows,
                    elapsed_ms,
                    "job processed"
                );
                JobTransition::Complete(result)
            }
            Err(failure) => {
                warn!(job_id = %job.id(), error = %failure, elapsed_ms, "job failed");
                JobTransition::Fail(failure.user_message())
            }
        };

        self.record_outcome(job, transition)
    }

    /// Store the outcome of `job`. If it cannot be written the job is failed
    /// instead, in memory as a last resort, so it never stays `processing`.
    fn record_outcome(&self, job: &Job, transition: JobTransition) -> Result<Job, JobStoreError> {
        let cause = match self.jobs.transition(job.id(), transition) {
            Err(JobStoreError::Storage(cause)) => cause,
            recorded => return recorded,
        };
        error!(job_id = %job.id(), error = %cause, "failed to persist job outcome");

        let fallback = JobTransition::Fail(INTERNAL_ERROR_MESSAGE.to_string());
        match self.jobs.transition(job.id(), fallback) {
            Err(JobStoreError::Storage(cause)) => {
                error!(job_id = %job.id(), error = %cause, "failed to persist job failure");
                self.jobs.fail_unpersisted(job.id(), INTERNAL_ERROR_MESSAGE)
            }
            recorded => recorded,
        }
    }

    /// Claim and process jobs on the calling thread until none are pending.
    ///
    /// Returns how many jobs reached a terminal state.
    pub fn run_pending(&self) -> Result<usize, JobStoreError> {
        let mut done = 0;
        while let Some(job) = self.jobs.claim_next()? {
            match self.process(&job) {
                Ok(_) => done += 1,
                Err(e @ JobStoreError::InvalidTransition { .. }) => {
                    warn!(job_id = %job.id(), error = %e, "ignoring duplicate completion");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Longest an idle worker sleeps before polling the store again
    pub poll_interval: Duration,
    /// Thread name prefix, also used in logs
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(100),
            name: "inference-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub workers: usize,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to a running worker pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: Arc<AtomicBool>,
    notifier: Arc<JobNotifier>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Stop claiming new jobs, let in-flight ones finish, and join all workers.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notifier.notify_all();
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> WorkerStats {
        let mut stats = self
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Fixed-size pool of inference worker threads.
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(
        processor: JobProcessor,
        notifier: Arc<JobNotifier>,
        config: WorkerPoolConfig,
    ) -> std::io::Result<WorkerPoolHandle> {
        let workers = config.workers.max(1);
        let stats = Arc::new(Mutex::new(WorkerStats {
            workers,
            ..WorkerStats::default()
        }));
        let mut handle = WorkerPoolHandle {
            shutdown: Arc::new(AtomicBool::new(false)),
            notifier: Arc::clone(&notifier),
            joins: Vec::with_capacity(workers),
            stats: Arc::clone(&stats),
            started: Instant::now(),
        };

        for index in 0..workers {
            let worker = Worker {
                name: format!("{}-{index}", config.name),
                processor: processor.clone(),
                notifier: Arc::clone(&notifier),
                shutdown: Arc::clone(&handle.shutdown),
                stats: Arc::clone(&stats),
                poll_interval: config.poll_interval,
            };
            let spawned = thread::Builder::new()
                .name(worker.name.clone())
                .spawn(move || worker.run());
            match spawned {
                Ok(join) => handle.joins.push(join),
                Err(e) => {
                    error!(pool = %config.name, error = %e, "failed to spawn inference worker");
                    handle.stop();
                    return Err(e);
                }
            }
        }

        info!(pool = %config.name, workers, "worker pool started");
        Ok(handle)
    }
}

struct Worker {
    name: String,
    processor: JobProcessor,
    notifier: Arc<JobNotifier>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Mutex<WorkerStats>>,
    poll_interval: Duration,
}

impl Worker {
    fn update_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut s) = self.stats.lock() {
            f(&mut s);
        }
    }

    fn run(self) {
        info!(worker = %self.name, "inference worker started");

        while !self.shutdown.load(Ordering::SeqCst) {
            let seen = self.notifier.generation();

            match self.processor.jobs.claim_next() {
                Ok(Some(job)) => {
                    debug!(worker = %self.name, job_id = %job.id(), "claimed job");
                    self.update_stats(|s| s.current_running += 1);

                    let result = self.processor.process(&job);

                    self.update_stats(|s| {
                        s.current_running = s.current_running.saturating_sub(1);
                        s.jobs_processed += 1;
                        match &result {
                            Ok(job) if job.state() == JobState::Processed => s.jobs_succeeded += 1,
                            _ => s.jobs_failed += 1,
                        }
                    });

                    match result {
                        Ok(_) => {}
                        Err(e @ JobStoreError::InvalidTransition { .. }) => {
                            warn!(worker = %self.name, job_id = %job.id(), error = %e, "ignoring duplicate completion");
                        }
                        Err(e) => {
                            error!(worker = %self.name, job_id = %job.id(), error = %e, "failed to record job outcome");
                        }
                    }
                }
                Ok(None) => self.notifier.wait(seen, self.poll_interval),
                Err(e) => {
                    error!(worker = %self.name, error = %e, "failed to claim job");
                    thread::sleep(self.poll_interval);
                }
            }
        }

        info!(worker = %self.name, "inference worker stopped");
    }
}
