use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use neuroscreen_infra::{QueryError, RemoveError, SubmitError};

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::TooLarge { .. } => {
            json_error(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", err.to_string())
        }
        SubmitError::Validation(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        SubmitError::Storage(msg) => {
            error!(error = %msg, "failed to store upload");
            internal_error()
        }
    }
}

pub fn query_error_to_response(err: QueryError) -> axum::response::Response {
    match err {
        QueryError::NotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "not_found", "EEG record not found")
        }
        QueryError::NotReady { state, .. } => json_error(
            StatusCode::CONFLICT,
            "not_ready",
            format!("prediction not available yet; record is {state}"),
        ),
        QueryError::JobFailed { message, .. } => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "job_failed", message)
        }
        QueryError::Storage(msg) => {
            error!(error = %msg, "job query failed");
            internal_error()
        }
    }
}

pub fn remove_error_to_response(err: RemoveError) -> axum::response::Response {
    match err {
        RemoveError::NotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "not_found", "EEG record not found")
        }
        RemoveError::InUse { state, .. } => json_error(
            StatusCode::CONFLICT,
            "record_in_use",
            format!("record is {state} and cannot be deleted yet"),
        ),
        RemoveError::Storage(msg) => {
            error!(error = %msg, "failed to delete record");
            internal_error()
        }
    }
}

pub fn multipart_error_to_response(err: MultipartError) -> axum::response::Response {
    let status = err.status();
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        return json_error(status, "payload_too_large", "upload exceeds the size limit");
    }
    json_error(StatusCode::BAD_REQUEST, "validation_error", err.body_text())
}

pub fn internal_error() -> axum::response::Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
}

pub fn invalid_record_id() -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid EEG record id")
}
