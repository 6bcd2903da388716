use axum::{routing::get, Router};

pub mod records;
pub mod system;

/// Router for all endpoints.
pub fn router(max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(system::health))
        .nest("/eeg-records", records::router(max_upload_bytes))
}
