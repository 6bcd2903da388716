use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arrow_array::{ArrayRef, Float64Array, RecordBatch};
use parquet::arrow::ArrowWriter;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};

use neuroscreen_ai::{ModelArtifact, SignalSpec};
use neuroscreen_api::app::services::{AcceptAllSubjects, AppServices, SubjectDirectory};
use neuroscreen_core::SubjectRef;
use neuroscreen_infra::jobs::WorkerPoolHandle;
use neuroscreen_infra::{Pipeline, PipelineConfig};

const CHANNELS: usize = 4;
const WINDOW: usize = 64;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    workers: Option<WorkerPoolHandle>,
    _dir: tempfile::TempDir,
}

fn test_config(dir: &Path, with_model: bool) -> PipelineConfig {
    let model_path = dir.join("eeg_classifier.json");
    if with_model {
        let artifact = ModelArtifact::reference(CHANNELS, WINDOW, 42);
        std::fs::write(&model_path, serde_json::to_vec(&artifact).unwrap()).unwrap();
    }
    PipelineConfig {
        model_path,
        data_dir: None,
        workers: 2,
        poll_interval: Duration::from_millis(10),
        signal: SignalSpec {
            expected_channels: CHANNELS,
            min_samples: 2 * WINDOW,
        },
        max_upload_bytes: 1024 * 1024,
        bind_addr: "127.0.0.1:0".to_string(),
    }
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(true, Arc::new(AcceptAllSubjects), |c| c).await
    }

    async fn spawn_with(
        with_model: bool,
        subjects: Arc<dyn SubjectDirectory>,
        tweak: impl FnOnce(PipelineConfig) -> PipelineConfig,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = tweak(test_config(dir.path(), with_model));

        // Same router as prod, but bound to an ephemeral port.
        let app = neuroscreen_api::app::build_app_with_subjects(&config, subjects).unwrap();
        Self::serve(app.router, Some(app.workers), dir).await
    }

    /// A server whose jobs are never picked up.
    async fn spawn_without_workers() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), true);
        let pipeline = Pipeline::from_config(&config).unwrap();
        let services = Arc::new(AppServices::new(pipeline, Arc::new(AcceptAllSubjects)));
        let router = neuroscreen_api::app::router(services, config.max_upload_bytes);
        Self::serve(router, None, dir).await
    }

    async fn serve(
        router: axum::Router,
        workers: Option<WorkerPoolHandle>,
        dir: tempfile::TempDir,
    ) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url,
            handle,
            workers,
            _dir: dir,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        if let Some(workers) = self.workers.take() {
            workers.shutdown();
        }
    }
}

struct KnownSubjects(HashSet<String>);

impl SubjectDirectory for KnownSubjects {
    fn exists(&self, subject: &SubjectRef) -> bool {
        self.0.contains(subject.as_str())
    }
}

fn csv(channels: usize, samples: usize) -> Vec<u8> {
    let mut out = String::from("time");
    for c in 0..channels {
        out.push_str(&format!(",E{c}"));
    }
    out.push('\n');
    for i in 0..samples {
        out.push_str(&format!("{}", i as f64 / 256.0));
        for c in 0..channels {
            let t = i as f64 / 256.0;
            let v = 30.0 * (2.0 * std::f64::consts::PI * (8.0 + c as f64) * t).sin();
            out.push_str(&format!(",{v:.4}"));
        }
        out.push('\n');
    }
    out.into_bytes()
}

fn parquet(channels: usize, samples: usize) -> Vec<u8> {
    let columns = (0..channels).map(|c| {
        let values: Vec<f64> = (0..samples)
            .map(|i| 30.0 * ((i * (c + 3)) as f64 * 0.05).sin())
            .collect();
        (format!("E{c}"), Arc::new(Float64Array::from(values)) as ArrayRef)
    });
    let batch = RecordBatch::try_from_iter(columns).unwrap();
    let mut out = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut out, batch.schema(), None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
    out
}

fn upload_form(patient: Option<&str>, file: Option<(Vec<u8>, &str)>) -> Form {
    let mut form = Form::new();
    if let Some(p) = patient {
        form = form.text("patient_id", p.to_string());
    }
    if let Some((bytes, name)) = file {
        form = form.part("file", Part::bytes(bytes).file_name(name.to_string()));
    }
    form
}

async fn upload(client: &reqwest::Client, base_url: &str, form: Form) -> reqwest::Response {
    client
        .post(format!("{}/eeg-records/upload", base_url))
        .multipart(form)
        .send()
        .await
        .unwrap()
}

async fn wait_for_terminal(client: &reqwest::Client, base_url: &str, id: &str) -> serde_json::Value {
    // Inference runs in the background; poll until the record settles.
    for _ in 0..500 {
        let res = client
            .get(format!("{}/eeg-records/{}/status", base_url, id))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body: serde_json::Value = res.json().await.unwrap();
        if matches!(body["status"].as_str(), Some("processed") | Some("failed")) {
            return body;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("record did not reach a terminal state within timeout");
}

#[tokio::test]
async fn upload_is_accepted_then_classified() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = upload(
        &client,
        &srv.base_url,
        upload_form(Some("patient-42"), Some((csv(CHANNELS, 10 * WINDOW), "session.csv"))),
    )
    .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "pending");
    let id = body["eeg_record_id"].as_str().unwrap().to_string();

    let status = wait_for_terminal(&client, &srv.base_url, &id).await;
    assert_eq!(status["status"], "processed");
    assert!(status.get("error_msg").is_none());
    let history: Vec<_> = status["history"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["state"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(history, ["pending", "processing", "processed"]);

    let res = client
        .get(format!("{}/eeg-records/{}/prediction", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let prediction: serde_json::Value = res.json().await.unwrap();
    let label = prediction["result"].as_str().unwrap();
    assert!(label == "alcoholic" || label == "non_alcoholic");
    let confidence = prediction["confidence"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&confidence));
    assert_eq!(prediction["windows"], 10);
    assert_eq!(prediction["model_version"], "reference-42");

    let res = client
        .get(format!("{}/eeg-records/{}", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let record: serde_json::Value = res.json().await.unwrap();
    assert_eq!(record["patient_id"], "patient-42");
    assert_eq!(record["file_name"], "session.csv");
    assert_eq!(record["file_type"], "csv");
    assert_eq!(record["channel_count"], CHANNELS);
    assert_eq!(record["prediction"]["result"], label);

    let res = client
        .get(format!("{}/health", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let health: serde_json::Value = res.json().await.unwrap();
    assert_eq!(health["model_loaded"], true);
    assert_eq!(health["jobs"]["processed"], 1);
}

#[tokio::test]
async fn corrupt_upload_is_rejected_without_creating_a_record() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = upload(
        &client,
        &srv.base_url,
        upload_form(Some("patient-1"), Some((b"E0,E1\n1.0,not-a-number\n".to_vec(), "bad.csv"))),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = upload(
        &client,
        &srv.base_url,
        upload_form(Some("patient-1"), Some((csv(CHANNELS + 1, 4 * WINDOW), "wide.csv"))),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("channels"));

    let res = client
        .get(format!("{}/eeg-records?patient_id=patient-1", srv.base_url))
        .send()
        .await
        .unwrap();
    let list: serde_json::Value = res.json().await.unwrap();
    assert_eq!(list["count"], 0);
}

#[tokio::test]
async fn upload_requires_patient_and_file() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = upload(
        &client,
        &srv.base_url,
        upload_form(None, Some((csv(CHANNELS, 4 * WINDOW), "rec.csv"))),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = upload(&client, &srv.base_url, upload_form(Some("patient-1"), None)).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["message"], "file is required");
}

#[tokio::test]
async fn unknown_subject_is_not_found() {
    let known = KnownSubjects(HashSet::from(["patient-1".to_string()]));
    let srv = TestServer::spawn_with(true, Arc::new(known), |c| c).await;
    let client = reqwest::Client::new();

    let res = upload(
        &client,
        &srv.base_url,
        upload_form(Some("patient-2"), Some((csv(CHANNELS, 4 * WINDOW), "rec.csv"))),
    )
    .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "subject_not_found");

    let res = upload(
        &client,
        &srv.base_url,
        upload_form(Some("patient-1"), Some((csv(CHANNELS, 4 * WINDOW), "rec.csv"))),
    )
    .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn oversized_upload_is_rejected() {
    let srv = TestServer::spawn_with(true, Arc::new(AcceptAllSubjects), |c| PipelineConfig {
        max_upload_bytes: 1024,
        ..c
    })
    .await;
    let client = reqwest::Client::new();

    let res = upload(
        &client,
        &srv.base_url,
        upload_form(Some("patient-1"), Some((csv(CHANNELS, 4 * WINDOW), "rec.csv"))),
    )
    .await;
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn missing_model_fails_the_record_with_a_safe_message() {
    let srv = TestServer::spawn_with(false, Arc::new(AcceptAllSubjects), |c| c).await;
    let client = reqwest::Client::new();

    let res = upload(
        &client,
        &srv.base_url,
        upload_form(Some("patient-1"), Some((csv(CHANNELS, 4 * WINDOW), "rec.csv"))),
    )
    .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    let id = body["eeg_record_id"].as_str().unwrap().to_string();

    let status = wait_for_terminal(&client, &srv.base_url, &id).await;
    assert_eq!(status["status"], "failed");
    let message = status["error_msg"].as_str().unwrap();
    assert!(message.starts_with("model unavailable"));
    assert!(!message.contains("eeg_classifier.json"));

    let res = client
        .get(format!("{}/eeg-records/{}/prediction", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "job_failed");
    assert_eq!(body["message"], message);

    let res = client
        .get(format!("{}/health", srv.base_url))
        .send()
        .await
        .unwrap();
    let health: serde_json::Value = res.json().await.unwrap();
    assert_eq!(health["model_loaded"], false);
}

#[tokio::test]
async fn prediction_is_not_ready_while_pending() {
    let srv = TestServer::spawn_without_workers().await;
    let client = reqwest::Client::new();

    let res = upload(
        &client,
        &srv.base_url,
        upload_form(Some("patient-1"), Some((csv(CHANNELS, 4 * WINDOW), "rec.csv"))),
    )
    .await;
    let body: serde_json::Value = res.json().await.unwrap();
    let id = body["eeg_record_id"].as_str().unwrap().to_string();

    let res = client
        .get(format!("{}/eeg-records/{}/prediction", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_ready");

    let res = client
        .get(format!("{}/eeg-records?status=pending", srv.base_url))
        .send()
        .await
        .unwrap();
    let list: serde_json::Value = res.json().await.unwrap();
    assert_eq!(list["count"], 1);
    assert_eq!(list["records"][0]["id"], id.as_str());
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let unknown = neuroscreen_core::JobId::new();
    for path in ["status", "prediction"] {
        let res = client
            .get(format!("{}/eeg-records/{}/{}", srv.base_url, unknown, path))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    let res = client
        .get(format!("{}/eeg-records/not-a-uuid/status", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_id");

    let res = client
        .get(format!("{}/eeg-records?status=finished", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn parquet_upload_is_classified() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = upload(
        &client,
        &srv.base_url,
        upload_form(Some("patient-1"), Some((parquet(CHANNELS, 4 * WINDOW), "session.parquet"))),
    )
    .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    let id = body["eeg_record_id"].as_str().unwrap().to_string();

    let status = wait_for_terminal(&client, &srv.base_url, &id).await;
    assert_eq!(status["status"], "processed");

    let res = client
        .get(format!("{}/eeg-records/{}", srv.base_url, id))
        .send()
        .await
        .unwrap();
    let record: serde_json::Value = res.json().await.unwrap();
    assert_eq!(record["file_type"], "parquet");
    assert_eq!(record["prediction"]["windows"], 4);
}

#[tokio::test]
async fn finished_record_can_be_deleted() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = upload(
        &client,
        &srv.base_url,
        upload_form(Some("patient-1"), Some((csv(CHANNELS, 4 * WINDOW), "rec.csv"))),
    )
    .await;
    let body: serde_json::Value = res.json().await.unwrap();
    let id = body["eeg_record_id"].as_str().unwrap().to_string();
    wait_for_terminal(&client, &srv.base_url, &id).await;

    let url = format!("{}/eeg-records/{}", srv.base_url, id);
    let res = client.delete(&url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = client.get(&url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.delete(&url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    let res = client
        .delete(format!("{}/eeg-records/not-a-uuid", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pending_record_can_be_withdrawn() {
    let srv = TestServer::spawn_without_workers().await;
    let client = reqwest::Client::new();

    let res = upload(
        &client,
        &srv.base_url,
        upload_form(Some("patient-1"), Some((csv(CHANNELS, 4 * WINDOW), "rec.csv"))),
    )
    .await;
    let body: serde_json::Value = res.json().await.unwrap();
    let id = body["eeg_record_id"].as_str().unwrap().to_string();

    let res = client
        .delete(format!("{}/eeg-records/{}", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = client
        .get(format!("{}/eeg-records", srv.base_url))
        .send()
        .await
        .unwrap();
    let list: serde_json::Value = res.json().await.unwrap();
    assert_eq!(list["count"], 0);
}
