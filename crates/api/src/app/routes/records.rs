//! EEG record endpoints: upload, status, prediction, lookup, listing and deletion.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Extension, Multipart, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::error;

use neuroscreen_core::{JobId, SubjectRef};
use neuroscreen_infra::jobs::{JobFilter, JobState};

use crate::app::{dto, errors, services::AppServices};

/// Room for multipart framing and the text fields on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn router(max_upload_bytes: usize) -> Router {
    Router::new()
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(
                max_upload_bytes.saturating_add(MULTIPART_OVERHEAD),
            )),
        )
        .route("/", get(list_records))
        .route("/:id", get(get_record).delete(delete_record))
        .route("/:id/status", get(get_status))
        .route("/:id/prediction", get(get_prediction))
}

fn parse_id(id: &str) -> Result<JobId, axum::response::Response> {
    id.parse().map_err(|_| errors::invalid_record_id())
}

struct UploadForm {
    subject: Option<String>,
    file_name: Option<String>,
    file: Option<Bytes>,
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, axum::response::Response> {
    let mut form = UploadForm {
        subject: None,
        file_name: None,
        file: None,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(errors::multipart_error_to_response)?
    {
        match field.name() {
            Some("patient_id") | Some("subject_reference") => {
                let text = field.text().await.map_err(errors::multipart_error_to_response)?;
                form.subject = Some(text);
            }
            Some("file") => {
                form.file_name = field.file_name().map(str::to_string);
                let bytes = field.bytes().await.map_err(errors::multipart_error_to_response)?;
                form.file = Some(bytes);
            }
            _ => {}
        }
    }

    Ok(form)
}

/// POST /eeg-records/upload
///
/// Validates the recording synchronously and answers 202 with the new record
/// id; classification happens in the background.
pub async fn upload(
    Extension(services): Extension<Arc<AppServices>>,
    multipart: Multipart,
) -> axum::response::Response {
    let form = match read_upload_form(multipart).await {
        Ok(form) => form,
        Err(resp) => return resp,
    };

    let Some(subject) = form.subject else {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "patient_id is required");
    };
    let subject = match SubjectRef::new(subject) {
        Ok(s) => s,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
    };
    let Some(file) = form.file else {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "file is required");
    };

    if !services.subjects().exists(&subject) {
        return errors::json_error(
            StatusCode::NOT_FOUND,
            "subject_not_found",
            format!("patient {subject} not found"),
        );
    }

    // Decoding a large recording is CPU-bound; keep it off the async workers.
    let svc = Arc::clone(&services);
    let file_name = form.file_name;
    let submitted = tokio::task::spawn_blocking(move || {
        svc.pipeline()
            .dispatcher()
            .submit(&file, file_name.as_deref(), subject)
    })
    .await;

    match submitted {
        Ok(Ok(job)) => (StatusCode::ACCEPTED, Json(dto::accepted_to_json(&job))).into_response(),
        Ok(Err(e)) => errors::submit_error_to_response(e),
        Err(e) => {
            error!(error = %e, "upload task failed");
            errors::internal_error()
        }
    }
}

/// GET /eeg-records/:id/status
pub async fn get_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.pipeline().queries().get_status(id) {
        Ok(view) => (StatusCode::OK, Json(dto::status_to_json(view))).into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}

/// GET /eeg-records/:id/prediction
pub async fn get_prediction(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.pipeline().queries().get_result(id) {
        Ok(result) => (StatusCode::OK, Json(dto::prediction_to_json(id, result))).into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}

/// GET /eeg-records/:id
pub async fn get_record(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.pipeline().queries().get_job(id) {
        Ok(job) => (StatusCode::OK, Json(dto::record_to_json(&job))).into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}

/// DELETE /eeg-records/:id
///
/// Removes the record and its stored recording. Records still being
/// classified answer 409.
pub async fn delete_record(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.pipeline().dispatcher().remove(id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::remove_error_to_response(e),
    }
}

/// GET /eeg-records?patient_id=&status=&limit=
pub async fn list_records(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListRecordsQuery>,
) -> axum::response::Response {
    let mut filter = JobFilter::default();

    if let Some(patient) = query.patient_id {
        match SubjectRef::new(patient) {
            Ok(s) => filter = filter.with_subject(s),
            Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        }
    }
    if let Some(status) = query.status {
        match status.parse::<JobState>() {
            Ok(state) => filter = filter.with_state(state),
            Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        }
    }
    if let Some(limit) = query.limit {
        filter = filter.with_limit(limit);
    }

    match services.pipeline().queries().list(&filter) {
        Ok(jobs) => {
            let records: Vec<_> = jobs.iter().map(dto::record_to_json).collect();
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "count": records.len(),
                    "records": records,
                })),
            )
                .into_response()
        }
        Err(e) => errors::query_error_to_response(e),
    }
}
