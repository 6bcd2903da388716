//! Service wiring for the HTTP layer.

use std::sync::Arc;

use neuroscreen_core::SubjectRef;
use neuroscreen_infra::{Pipeline, PipelineConfig, PipelineError};
use neuroscreen_infra::jobs::WorkerPoolHandle;

/// Lookup of subjects (patients) that recordings may be attached to.
pub trait SubjectDirectory: Send + Sync {
    fn exists(&self, subject: &SubjectRef) -> bool;
}

/// Directory used when no subject registry is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllSubjects;

impl SubjectDirectory for AcceptAllSubjects {
    fn exists(&self, _subject: &SubjectRef) -> bool {
        true
    }
}

pub struct AppServices {
    pipeline: Pipeline,
    subjects: Arc<dyn SubjectDirectory>,
}

impl AppServices {
    pub fn new(pipeline: Pipeline, subjects: Arc<dyn SubjectDirectory>) -> Self {
        Self { pipeline, subjects }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn subjects(&self) -> &dyn SubjectDirectory {
        self.subjects.as_ref()
    }
}

/// Build services from configuration and start the worker pool.
pub fn build_services(
    config: &PipelineConfig,
    subjects: Arc<dyn SubjectDirectory>,
) -> Result<(Arc<AppServices>, WorkerPoolHandle), PipelineError> {
    let pipeline = Pipeline::from_config(config)?;
    let workers = pipeline.start_workers()?;
    Ok((Arc::new(AppServices::new(pipeline, subjects)), workers))
}
