use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::{dto, errors, services::AppServices};

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let pipeline = services.pipeline();
    match pipeline.queries().stats() {
        Ok(stats) => (
            StatusCode::OK,
            Json(dto::health_to_json(pipeline.registry().is_loaded(), stats)),
        )
            .into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}
