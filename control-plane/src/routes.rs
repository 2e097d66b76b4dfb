//! REST API surface

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use trainforge_proto::{
    ClaimRequest, HealthResponse, HeartbeatRequest, JobConfig, JobPriority, JobStatus, LogBatch,
    LogLine, RegisterRequest, ResourceRequest, StatusUpdate, SubmitResponse,
};
use trainforge_scheduler::JobRecord;

use crate::state::AppState;

/// Uploads are bounded; project archives can carry datasets.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Build the full API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/jobs", post(submit_job).get(list_jobs))
        .route("/api/jobs/distributed", post(submit_distributed_job))
        .route("/api/jobs/pending", get(pending_jobs))
        .route("/api/jobs/{job_id}", get(get_job))
        .route("/api/jobs/{job_id}/status", put(update_status))
        .route("/api/jobs/{job_id}/cancel", post(cancel_job))
        .route("/api/jobs/{job_id}/logs", post(append_log))
        .route("/api/jobs/{job_id}/logs/batch", post(append_log_batch))
        .route("/api/jobs/{job_id}/files", get(download_project))
        .route("/api/jobs/{job_id}/claim", post(claim_job))
        .route(
            "/api/jobs/{job_id}/results",
            post(upload_results).get(download_results),
        )
        .route("/api/workers", get(list_workers))
        .route("/api/workers/register", post(register_worker))
        .route("/api/workers/{worker_id}/heartbeat", post(worker_heartbeat))
        .route(
            "/api/workers/{worker_id}/deregister",
            post(deregister_worker),
        )
        .route("/api/status", get(cluster_status))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Error mapping ===

/// Handler-level error, converted to a JSON body with the right status.
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Conflict(m) => (StatusCode::CONFLICT, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<trainforge_scheduler::Error> for ApiError {
    fn from(e: trainforge_scheduler::Error) -> Self {
        use trainforge_scheduler::Error;
        match e {
            Error::JobNotFound(_) | Error::WorkerNotFound(_) => Self::NotFound(e.to_string()),
            Error::TerminalState(_) | Error::InvalidTransition { .. } => {
                Self::Conflict(e.to_string())
            }
            Error::Io(_) | Error::Serialization(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            Self::Conflict(e.to_string())
        } else {
            Self::Internal(e.to_string())
        }
    }
}

// === Response types ===

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: String,
    pub project: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub resources: ResourceRequest,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_worker: Option<String>,
    pub distributed: bool,
    pub world_size: u32,
    pub progress: Option<f32>,
    pub error_message: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    #[serde(flatten)]
    pub job: JobResponse,
    pub logs: Vec<LogLine>,
}

fn job_to_response(job: &JobRecord) -> JobResponse {
    JobResponse {
        job_id: job.id.clone(),
        project: job.project.clone(),
        status: job.status,
        priority: job.priority,
        resources: job.resources.clone(),
        submitted_at: job.submitted_at,
        started_at: job.started_at,
        completed_at: job.completed_at,
        assigned_worker: job.assigned_worker.clone(),
        distributed: job.distributed,
        world_size: job.world_size,
        progress: job.progress,
        error_message: job.error_message.clone(),
        attempts: job.attempts,
    }
}

// === Job submission ===

async fn submit_job(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    submit_inner(state, multipart, false).await
}

async fn submit_distributed_job(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    submit_inner(state, multipart, true).await
}

async fn submit_inner(
    state: Arc<AppState>,
    mut multipart: Multipart,
    distributed: bool,
) -> Result<impl IntoResponse, ApiError> {
    let mut config: Option<JobConfig> = None;
    let mut archive: Option<bytes::Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("config") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                config = Some(
                    serde_json::from_str(&text)
                        .map_err(|e| ApiError::BadRequest(format!("invalid config: {}", e)))?,
                );
            }
            Some("project") => {
                archive = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let config = config.ok_or_else(|| ApiError::BadRequest("missing config field".to_string()))?;
    let archive =
        archive.ok_or_else(|| ApiError::BadRequest("missing project archive".to_string()))?;

    if distributed && config.num_workers < 2 {
        return Err(ApiError::BadRequest(
            "distributed jobs need num_workers >= 2".to_string(),
        ));
    }
    if config.entrypoint.trim().is_empty() {
        return Err(ApiError::BadRequest("entrypoint must be set".to_string()));
    }

    let record = state.scheduler.submit(config)?;
    state.archives.save_project(&record.id, &archive)?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            job_id: record.id.clone(),
            status: record.status,
            resources: record.resources.clone(),
            created_at: record.submitted_at,
        }),
    ))
}

// === Job queries ===

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<JobResponse>> {
    let limit = query.limit.unwrap_or(50);
    Json(
        state
            .scheduler
            .list()
            .iter()
            .take(limit)
            .map(job_to_response)
            .collect(),
    )
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobDetailResponse>, ApiError> {
    let job = state
        .scheduler
        .get(&job_id)
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {}", job_id)))?;

    Ok(Json(JobDetailResponse {
        logs: job.log_tail.iter().cloned().collect(),
        job: job_to_response(&job),
    }))
}

#[derive(Debug, Deserialize)]
struct PendingQuery {
    #[serde(default)]
    worker_id: Option<String>,
}

/// Worker-facing queue view. With a worker id the scheduler reserves the
/// best fitting job for that worker; without one it is a plain listing.
async fn pending_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PendingQuery>,
) -> impl IntoResponse {
    match query.worker_id {
        Some(worker_id) => Json(state.scheduler.offer(&worker_id)),
        None => Json(state.scheduler.pending_view()),
    }
}

async fn cluster_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.scheduler.status())
}

// === Worker-driven transitions ===

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<JobResponse>, ApiError> {
    let record = state.scheduler.update_status(&job_id, update)?;
    Ok(Json(job_to_response(&record)))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let record = state.scheduler.cancel(&job_id)?;
    Ok(Json(job_to_response(&record)))
}

#[derive(Debug, Deserialize)]
struct SingleLog {
    message: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

async fn append_log(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Json(line): Json<SingleLog>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.append_logs(
        &job_id,
        vec![LogLine {
            message: line.message,
            timestamp: line.timestamp.unwrap_or_else(Utc::now),
        }],
    )?;
    Ok(StatusCode::OK)
}

async fn append_log_batch(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Json(batch): Json<LogBatch>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.append_logs(&job_id, batch.logs)?;
    Ok(StatusCode::OK)
}

async fn claim_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Json(request): Json<ClaimRequest>,
) -> Response {
    let response = state.scheduler.claim(&job_id, &request.worker_id);
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(response)).into_response()
}

// === Archives ===

async fn download_project(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let bytes = state
        .archives
        .read_project(&job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("no project archive for job {}", job_id)))?;
    Ok(zip_response("project.zip", bytes))
}

async fn upload_results(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    mut multipart: Multipart,
) -> Result<StatusCode, ApiError> {
    if state.scheduler.get(&job_id).is_none() {
        return Err(ApiError::NotFound(format!("job not found: {}", job_id)));
    }

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {}", e)))?
    {
        if matches!(field.name(), Some("results") | Some("results_zip")) {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            state.archives.save_results(&job_id, &bytes)?;
            return Ok(StatusCode::OK);
        }
    }

    Err(ApiError::BadRequest("missing results archive".to_string()))
}

async fn download_results(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let bytes = state
        .archives
        .read_results(&job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("no results for job {}", job_id)))?;
    Ok(zip_response("results.zip", bytes))
}

fn zip_response(name: &str, bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name),
            ),
        ],
        bytes,
    )
        .into_response()
}

// === Worker registry ===

#[derive(Debug, Serialize)]
struct RegisteredResponse {
    status: String,
    worker_id: String,
}

async fn register_worker(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> impl IntoResponse {
    state.scheduler.register_worker(&request);
    (
        StatusCode::CREATED,
        Json(RegisteredResponse {
            status: "registered".to_string(),
            worker_id: request.worker_id,
        }),
    )
}

async fn worker_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state
        .scheduler
        .heartbeat(&worker_id, request.current_job_ids)?;
    Ok(Json(response))
}

async fn deregister_worker(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.deregister_worker(&worker_id)?;
    Ok(StatusCode::OK)
}

async fn list_workers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.scheduler.workers().summaries())
}

// === Health ===

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let database = if state.scheduler.store_healthy() {
        "connected"
    } else {
        warn!("job store unavailable");
        "unavailable"
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        database: database.to_string(),
    })
}
