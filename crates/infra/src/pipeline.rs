//! Wiring of stores, model registry, dispatcher, queries and workers.

use std::sync::Arc;

use tracing::info;

use neuroscreen_ai::ModelRegistry;

use crate::config::PipelineConfig;
use crate::dispatcher::AsyncDispatcher;
use crate::jobs::{
    FsJobStore, InMemoryJobStore, JobNotifier, JobProcessor, JobStore, JobStoreError, WorkerPool,
    WorkerPoolConfig, WorkerPoolHandle,
};
use crate::queries::JobQueries;
use crate::recordings::{FsRecordingStore, InMemoryRecordingStore, RecordingStore, RecordingStoreError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error(transparent)]
    Recordings(#[from] RecordingStoreError),
    #[error("failed to start workers: {0}")]
    Workers(#[from] std::io::Error),
}

/// The assembled pipeline. Cheap to share behind an `Arc`.
pub struct Pipeline {
    jobs: Arc<dyn JobStore>,
    recordings: Arc<dyn RecordingStore>,
    registry: Arc<ModelRegistry>,
    notifier: Arc<JobNotifier>,
    dispatcher: AsyncDispatcher,
    queries: JobQueries,
    workers: WorkerPoolConfig,
}

impl Pipeline {
    /// Build stores from `config` (durable when `data_dir` is set) and a
    /// registry loading the configured model path.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let (jobs, recordings): (Arc<dyn JobStore>, Arc<dyn RecordingStore>) =
            match &config.data_dir {
                Some(dir) => {
                    info!(dir = %dir.display(), "using filesystem storage");
                    (
                        Arc::new(FsJobStore::open(dir)?),
                        Arc::new(FsRecordingStore::open(dir)?),
                    )
                }
                None => {
                    info!("using in-memory storage");
                    (
                        Arc::new(InMemoryJobStore::new()),
                        Arc::new(InMemoryRecordingStore::new()),
                    )
                }
            };
        let registry = Arc::new(ModelRegistry::from_path(&config.model_path));
        Ok(Self::with_parts(jobs, recordings, registry, config))
    }

    pub fn with_parts(
        jobs: Arc<dyn JobStore>,
        recordings: Arc<dyn RecordingStore>,
        registry: Arc<ModelRegistry>,
        config: &PipelineConfig,
    ) -> Self {
        let notifier = Arc::new(JobNotifier::new());
        let dispatcher = AsyncDispatcher::new(
            Arc::clone(&jobs),
            Arc::clone(&recordings),
            Arc::clone(&notifier),
            config.signal,
            config.max_upload_bytes,
        );
        let queries = JobQueries::new(Arc::clone(&jobs));
        let workers = WorkerPoolConfig::default()
            .with_workers(config.workers)
            .with_poll_interval(config.poll_interval);

        Self {
            jobs,
            recordings,
            registry,
            notifier,
            dispatcher,
            queries,
            workers,
        }
    }

    pub fn dispatcher(&self) -> &AsyncDispatcher {
        &self.dispatcher
    }

    pub fn queries(&self) -> &JobQueries {
        &self.queries
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn processor(&self) -> JobProcessor {
        JobProcessor::new(
            Arc::clone(&self.jobs),
            Arc::clone(&self.recordings),
            Arc::clone(&self.registry),
        )
    }

    /// Spawn the configured worker pool.
    pub fn start_workers(&self) -> Result<WorkerPoolHandle, PipelineError> {
        Ok(WorkerPool::spawn(
            self.processor(),
            Arc::clone(&self.notifier),
            self.workers.clone(),
        )?)
    }
}
