//! HTTP status server
//!
//! Thin axum router over the job manager, the hardware profile and the
//! system metrics sampler.

use crate::events::download_url;
use crate::hardware::{CodecFamily, HardwareDetector, HardwareProfile, HardwareType, ProbeRunner, SharedHardware};
use crate::job::{CompressRequest, JobRecord, JobState, VideoCodec};
use crate::manager::{CancelOutcome, JobError, JobLifecycleManager, QueueStatus};
use crate::metrics::{MetricsSampler, MetricsSnapshot};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path as FsPath;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Errors that can occur when running the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// Request-level failure, rendered as `{"detail": ...}`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Validation(e) => ApiError::BadRequest(e.to_string()),
            JobError::NotFound(id) => ApiError::NotFound(id),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Detector shared with the redetect endpoint
pub type SharedDetector = Arc<HardwareDetector<Arc<dyn ProbeRunner>>>;

#[derive(Clone)]
pub struct AppState {
    pub manager: JobLifecycleManager,
    pub hardware: Arc<SharedHardware>,
    pub detector: SharedDetector,
    pub metrics: Arc<MetricsSampler>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressResponse {
    pub task_id: String,
}

/// Job record plus the download link once completed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobView {
    #[serde(flatten)]
    pub record: JobRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        let download_url =
            (record.state == JobState::Completed).then(|| download_url(&record.task_id));
        Self {
            record,
            download_url,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelResponse {
    pub task_id: String,
    /// `canceled`, `signaled` or `already_finished`
    pub outcome: String,
    pub state: JobState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodecsResponse {
    pub hardware_type: HardwareType,
    pub available_encoders: BTreeMap<CodecFamily, String>,
    /// Every selectable encoder usable on this host
    pub enabled_codecs: Vec<String>,
}

impl CodecsResponse {
    pub fn from_profile(profile: &HardwareProfile) -> Self {
        let enabled_codecs = VideoCodec::ALL
            .iter()
            .filter(|codec| profile.supports(codec.as_str()))
            .map(|codec| codec.as_str().to_string())
            .collect();
        Self {
            hardware_type: profile.hw_type,
            available_encoders: profile.available_encoders.clone(),
            enabled_codecs,
        }
    }
}

async fn compress(
    State(state): State<AppState>,
    Json(request): Json<CompressRequest>,
) -> Result<(StatusCode, Json<CompressResponse>), ApiError> {
    let task_id = state.manager.enqueue(request).await?;
    Ok((StatusCode::ACCEPTED, Json(CompressResponse { task_id })))
}

async fn job_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let record = state
        .manager
        .status(&task_id)
        .await
        .ok_or(ApiError::NotFound(task_id))?;
    Ok(Json(record.into()))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let outcome = state.manager.cancel(&task_id).await?;
    let (outcome, job_state) = match outcome {
        CancelOutcome::Canceled => ("canceled", JobState::Canceled),
        CancelOutcome::Signaled => ("signaled", JobState::Running),
        CancelOutcome::AlreadyFinished(s) => ("already_finished", s),
    };
    Ok(Json(CancelResponse {
        task_id,
        outcome: outcome.to_string(),
        state: job_state,
    }))
}

async fn queue(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.manager.queue_status().await)
}

async fn available_codecs(State(state): State<AppState>) -> Json<CodecsResponse> {
    Json(CodecsResponse::from_profile(&state.hardware.snapshot()))
}

async fn redetect_codecs(State(state): State<AppState>) -> Result<Json<CodecsResponse>, ApiError> {
    let hardware = Arc::clone(&state.hardware);
    let detector = Arc::clone(&state.detector);
    let profile = tokio::task::spawn_blocking(move || hardware.redetect(&*detector))
        .await
        .map_err(|e| ApiError::Internal(format!("detection task failed: {}", e)))?;
    info!(hardware = %profile.hw_type, "Hardware re-detected");
    Ok(Json(CodecsResponse::from_profile(&profile)))
}

async fn system_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    let queue = state.manager.queue_status().await;
    let hw_type = state.hardware.snapshot().hw_type;
    Json(state.metrics.snapshot(queue, hw_type))
}

fn content_type(path: &FsPath) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("m4a") => "audio/mp4",
        _ => "application/octet-stream",
    }
}

/// `<upload stem>_compressed.<output ext>`
fn download_name(filename: &str, output: &FsPath) -> String {
    let stem: String = FsPath::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .chars()
        .filter(|c| !matches!(c, '"' | '\\' | '\r' | '\n'))
        .collect();
    let ext = output.extension().and_then(|e| e.to_str()).unwrap_or("bin");
    format!("{}_compressed.{}", stem, ext)
}

async fn download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let record = state
        .manager
        .status(&task_id)
        .await
        .ok_or_else(|| ApiError::NotFound(task_id.clone()))?;
    if record.state != JobState::Completed {
        return Err(ApiError::Conflict(format!("job is {}", record.state)));
    }
    let path = record
        .output_path
        .ok_or_else(|| ApiError::NotFound(task_id.clone()))?;

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(task_id = %task_id, path = %path.display(), error = %e, "Output missing");
            return Err(ApiError::NotFound(task_id));
        }
    };
    let len = file.metadata().await.ok().map(|m| m.len());

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, content_type(&path))
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", download_name(&record.filename, &path)),
        );
    if let Some(len) = len {
        response = response.header(header::CONTENT_LENGTH, len);
    }
    response
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Creates the axum Router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/compress", post(compress))
        .route("/api/jobs/:task_id", get(job_status))
        .route("/api/jobs/:task_id/cancel", post(cancel_job))
        .route("/api/jobs/:task_id/download", get(download))
        .route("/api/queue", get(queue))
        .route("/api/codecs/available", get(available_codecs))
        .route("/api/codecs/redetect", post(redetect_codecs))
        .route("/api/system/metrics", get(system_metrics))
        .with_state(state)
}

/// Serve until `shutdown` fires
pub async fn run_server(
    host: &str,
    port: u16,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(ServerError::Serve)
}
