use serde::Deserialize;
use serde_json::json;

use neuroscreen_ai::InferenceResult;
use neuroscreen_core::JobId;
use neuroscreen_infra::JobStatusView;
use neuroscreen_infra::jobs::{Job, JobStats};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListRecordsQuery {
    pub patient_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

// -------------------------
// Response mapping
// -------------------------

pub fn accepted_to_json(job: &Job) -> serde_json::Value {
    json!({
        "eeg_record_id": job.id(),
        "status": job.state(),
    })
}

pub fn status_to_json(view: JobStatusView) -> serde_json::Value {
    let mut body = json!({
        "id": view.id,
        "status": view.state,
        "created_at": view.created_at,
        "updated_at": view.updated_at,
        "history": view.history,
    });
    if let Some(msg) = view.error_message {
        body["error_msg"] = json!(msg);
    }
    body
}

pub fn prediction_to_json(id: JobId, result: InferenceResult) -> serde_json::Value {
    json!({
        "eeg_record_id": id,
        "result": result.label,
        "confidence": result.confidence,
        "probabilities": result.probabilities,
        "raw_probability": result.raw_probability,
        "windows": result.windows,
        "model_name": result.model_name,
        "model_version": result.model_version,
    })
}

pub fn record_to_json(job: &Job) -> serde_json::Value {
    let recording = job.recording();
    json!({
        "id": job.id(),
        "patient_id": job.subject_reference(),
        "status": job.state(),
        "file_name": recording.file_name,
        "file_type": recording.file_format,
        "file_size_bytes": recording.file_size_bytes,
        "channel_count": recording.channel_count,
        "sample_count": recording.sample_count,
        "created_at": job.created_at(),
        "updated_at": job.updated_at(),
        "started_at": job.started_at(),
        "finished_at": job.finished_at(),
        "processing_time_ms": job.processing_time_ms(),
        "error_msg": job.error_message(),
        "prediction": job.result().cloned().map(|r| prediction_to_json(job.id(), r)),
    })
}

pub fn health_to_json(model_loaded: bool, jobs: JobStats) -> serde_json::Value {
    json!({
        "status": "ok",
        "model_loaded": model_loaded,
        "jobs": jobs,
    })
}
