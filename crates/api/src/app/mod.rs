//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: pipeline wiring and the subject directory seam
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: query DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use neuroscreen_infra::jobs::WorkerPoolHandle;
use neuroscreen_infra::{PipelineConfig, PipelineError};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::{AcceptAllSubjects, AppServices, SubjectDirectory};

/// A ready-to-serve application: the router plus the worker pool feeding it.
pub struct App {
    pub router: Router,
    pub workers: WorkerPoolHandle,
    pub services: Arc<AppServices>,
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(config: &PipelineConfig) -> Result<App, PipelineError> {
    build_app_with_subjects(config, Arc::new(AcceptAllSubjects))
}

pub fn build_app_with_subjects(
    config: &PipelineConfig,
    subjects: Arc<dyn SubjectDirectory>,
) -> Result<App, PipelineError> {
    let (services, workers) = services::build_services(config, subjects)?;
    Ok(App {
        router: router(Arc::clone(&services), config.max_upload_bytes),
        workers,
        services,
    })
}

pub fn router(services: Arc<AppServices>, max_upload_bytes: usize) -> Router {
    routes::router(max_upload_bytes).layer(ServiceBuilder::new().layer(Extension(services)))
}
