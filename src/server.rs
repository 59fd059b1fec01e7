//! HTTP coordinator.
//!
//! Thin routing layer over the core: presigned upload handshake, job
//! enqueueing and status polling, the SSE generation stream, processed-file
//! download URLs, collection listing, and health.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/v1/ingest/upload/presign` | Presign one upload, record it |
//! | `POST` | `/api/v1/ingest/upload/presign/batch` | Presign many uploads |
//! | `POST` | `/api/v1/ingest/enqueue` | Enqueue validation for an upload |
//! | `POST` | `/api/v1/ingest/enqueue/batch` | Enqueue many validations |
//! | `GET`  | `/api/v1/ingest/status` | Poll an ingest job result |
//! | `POST` | `/api/v1/generate` | Submit a non-streaming generation job |
//! | `POST` | `/api/v1/generate/status` | Poll a generation job result |
//! | `GET`  | `/api/v1/generate/stream` | SSE stream of a generation job |
//! | `GET`  | `/api/v1/files/download` | Presigned download for processed keys |
//! | `GET`  | `/api/v1/collections/` | List vector collections |
//! | `GET`  | `/api/v1/health/` | Health check |
//!
//! The SSE subscriber long-polls the per-job Redis stream (1 s block, 10
//! events per read), tracks the last delivered entry id, and terminates on
//! the first `done` or `error` event.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::{Config, PRESIGN_EXPIRES_SECONDS, UPLOAD_RECORD_GRACE_SECONDS};
use crate::events;
use crate::generate::ACTOR_GENERATE_ANSWER_STREAM;
use crate::ingest_jobs::{ValidatePromoteArgs, ACTOR_VALIDATE_AND_PROMOTE};
use crate::loader::file_extension;
use crate::models::{UploadRecord, UploadStatus};
use crate::object_store::ObjectStore;
use crate::queue::{JobMessage, JobQueue, JobResultState, QUEUE_GENERATION, QUEUE_INGEST_VALIDATE};
use crate::store::VectorStore;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    object_store: Arc<ObjectStore>,
    queue: JobQueue,
    store: VectorStore,
}

/// Start the coordinator. The object-store bucket is created on startup if
/// absent; Postgres and Redis are reached lazily per request.
pub async fn run_server(config: Config) -> Result<()> {
    let bind_addr = config.server.bind.clone();

    let object_store = Arc::new(ObjectStore::new(&config.object_store)?);
    object_store.ensure_bucket().await?;

    let queue = JobQueue::connect(&config.redis).await?;
    let store = VectorStore::connect_lazy(&config.postgres)?;

    let state = AppState {
        config: Arc::new(config),
        object_store,
        queue,
        store,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/ingest/upload/presign", post(presign_upload))
        .route("/ingest/upload/presign/batch", post(presign_batch))
        .route("/ingest/enqueue", post(enqueue_after_upload))
        .route("/ingest/enqueue/batch", post(enqueue_batch))
        .route("/ingest/status", get(ingest_job_status))
        .route("/generate", post(submit_generation))
        .route("/generate/status", post(generation_status))
        .route("/generate/stream", get(generate_stream))
        .route("/files/download", get(download_url))
        .route("/collections/", get(list_collections))
        .route("/health/", get(health));

    let app = Router::new()
        .nest("/api/v1", api)
        .layer(cors)
        .with_state(state);

    tracing::info!(bind = %bind_addr, "API listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

struct AppError {
    status: StatusCode,
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                detail: self.detail,
            }),
        )
            .into_response()
    }
}

fn bad_request(detail: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        detail: detail.into(),
    }
}

fn not_found(detail: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        detail: detail.into(),
    }
}

fn internal_error(e: impl std::fmt::Display) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        detail: e.to_string(),
    }
}

// ============ POST /ingest/upload/presign ============

#[derive(Deserialize)]
struct PresignReq {
    filename: String,
    /// Accepted for wire compatibility; the binding collection is the one
    /// supplied at enqueue time.
    #[serde(default)]
    #[allow(dead_code)]
    collection: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Serialize)]
struct PresignResp {
    doc_id: String,
    s3_key: String,
    upload_url: String,
    expires_in: u64,
    headers: BTreeMap<String, String>,
}

async fn presign_upload(
    State(state): State<AppState>,
    Json(req): Json<PresignReq>,
) -> Result<Json<PresignResp>, AppError> {
    let ext = file_extension(&req.filename);
    if !state.config.allowed_extensions.contains(&ext) {
        return Err(bad_request(format!(
            "File extension not allowed: {}",
            req.filename
        )));
    }

    let doc_id = Uuid::new_v4().to_string();
    let s3_key = format!("uploads/{}/{}", doc_id, req.filename);
    let expires_in = PRESIGN_EXPIRES_SECONDS;
    tracing::info!(doc_id = %doc_id, filename = %req.filename, "creating presigned upload");

    let upload_url = state.object_store.presigned_put_url(&s3_key, expires_in);

    let now = Utc::now().timestamp();
    let record = UploadRecord {
        doc_id: doc_id.clone(),
        s3_key: s3_key.clone(),
        filename: req.filename.clone(),
        status: UploadStatus::Presigned,
        created_at: now,
        expires_at: now + expires_in as i64,
    };

    let mut conn = state.queue.manager();
    let record_key = format!("upload:{}", doc_id);
    let _: () = conn
        .hset_multiple(&record_key, &record.to_pairs())
        .await
        .map_err(internal_error)?;
    let _: bool = conn
        .expire(
            &record_key,
            (expires_in + UPLOAD_RECORD_GRACE_SECONDS) as i64,
        )
        .await
        .map_err(internal_error)?;

    let mut headers = BTreeMap::new();
    headers.insert(
        "Content-Type".to_string(),
        req.content_type
            .unwrap_or_else(|| "application/octet-stream".to_string()),
    );

    Ok(Json(PresignResp {
        doc_id,
        s3_key,
        upload_url,
        expires_in,
        headers,
    }))
}

// ============ POST /ingest/upload/presign/batch ============

#[derive(Deserialize)]
struct BatchPresignReq {
    #[serde(default)]
    #[allow(dead_code)]
    collection: Option<String>,
    files: Vec<PresignReq>,
}

#[derive(Serialize)]
struct BatchPresignResp {
    items: Vec<PresignResp>,
}

async fn presign_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchPresignReq>,
) -> Result<Json<BatchPresignResp>, AppError> {
    let expires_in = PRESIGN_EXPIRES_SECONDS;
    let mut items = Vec::with_capacity(req.files.len());

    for file in req.files {
        let ext = file_extension(&file.filename);
        if !state.config.allowed_extensions.contains(&ext) {
            return Err(bad_request(format!(
                "File extension not allowed: {}",
                file.filename
            )));
        }

        let doc_id = Uuid::new_v4().to_string();
        let s3_key = format!("uploads/{}/{}", doc_id, file.filename);
        tracing::info!(doc_id = %doc_id, filename = %file.filename, "creating presigned upload");
        let upload_url = state.object_store.presigned_put_url(&s3_key, expires_in);

        let mut headers = BTreeMap::new();
        headers.insert(
            "Content-Type".to_string(),
            file.content_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        );

        items.push(PresignResp {
            doc_id,
            s3_key,
            upload_url,
            expires_in,
            headers,
        });
    }

    Ok(Json(BatchPresignResp { items }))
}

// ============ POST /ingest/enqueue ============

#[derive(Deserialize, Clone)]
struct EnqueueReq {
    doc_id: String,
    s3_key: String,
    filename: String,
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    checksum_sha256: Option<String>,
}

async fn enqueue_after_upload(
    State(state): State<AppState>,
    Json(req): Json<EnqueueReq>,
) -> Result<Json<serde_json::Value>, AppError> {
    let record_key = format!("upload:{}", req.doc_id);
    let mut conn = state.queue.manager();
    let stored: HashMap<String, String> = conn
        .hgetall(&record_key)
        .await
        .map_err(internal_error)?;

    // The stored record must exist and its (doc_id, s3_key) pair must match
    // what the client claims. Expired records read as empty hashes.
    let pair_matches = stored.get("s3_key").map(String::as_str) == Some(req.s3_key.as_str())
        && stored.get("doc_id").map(String::as_str) == Some(req.doc_id.as_str());
    if stored.is_empty() || !pair_matches {
        return Err(bad_request(
            "doc_id and s3_key do not match any known upload.",
        ));
    }

    if !state
        .object_store
        .object_exists(&req.s3_key)
        .await
        .map_err(internal_error)?
    {
        return Err(not_found(format!("S3 key not found: {}", req.s3_key)));
    }

    let collection = req
        .collection
        .ok_or_else(|| bad_request("collection is required"))?;

    let message = state
        .queue
        .enqueue(
            QUEUE_INGEST_VALIDATE,
            ACTOR_VALIDATE_AND_PROMOTE,
            serde_json::to_value(ValidatePromoteArgs {
                doc_id: req.doc_id,
                s3_key: req.s3_key,
                filename: req.filename,
                collection,
                checksum_sha256: req.checksum_sha256,
            })
            .map_err(internal_error)?,
        )
        .await
        .map_err(internal_error)?;

    Ok(Json(serde_json::json!({
        "job_id": message.message_id,
        "queue": message.queue_name,
        "actor": message.actor_name,
    })))
}

// ============ POST /ingest/enqueue/batch ============

#[derive(Deserialize)]
struct EnqueueBatchReq {
    collection: String,
    items: Vec<EnqueueReq>,
}

#[derive(Serialize)]
struct EnqueueBatchResp {
    collection: String,
    job_ids: Vec<String>,
    file_refused: Vec<String>,
    queue: Option<String>,
}

async fn enqueue_batch(
    State(state): State<AppState>,
    Json(req): Json<EnqueueBatchReq>,
) -> Result<Json<EnqueueBatchResp>, AppError> {
    let mut job_ids = Vec::new();
    let mut file_refused = Vec::new();
    let mut queue_name: Option<String> = None;

    for item in req.items {
        let exists = state
            .object_store
            .object_exists(&item.s3_key)
            .await
            .map_err(internal_error)?;
        if !exists {
            tracing::warn!(s3_key = %item.s3_key, "S3 key not found, skipping");
            file_refused.push(item.doc_id);
            continue;
        }

        let message = state
            .queue
            .enqueue(
                QUEUE_INGEST_VALIDATE,
                ACTOR_VALIDATE_AND_PROMOTE,
                serde_json::to_value(ValidatePromoteArgs {
                    doc_id: item.doc_id,
                    s3_key: item.s3_key,
                    filename: item.filename,
                    collection: req.collection.clone(),
                    checksum_sha256: item.checksum_sha256,
                })
                .map_err(internal_error)?,
            )
            .await
            .map_err(internal_error)?;

        job_ids.push(message.message_id);
        queue_name.get_or_insert(message.queue_name);
    }

    Ok(Json(EnqueueBatchResp {
        collection: req.collection,
        job_ids,
        file_refused,
        queue: queue_name,
    }))
}

// ============ GET /ingest/status ============

#[derive(Deserialize)]
struct JobStatusQuery {
    job_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    queue: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    actor_name: Option<String>,
    #[serde(default)]
    wait_ms: u64,
}

async fn ingest_job_status(
    State(state): State<AppState>,
    Query(query): Query<JobStatusQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let result = state
        .queue
        .get_result(&query.job_id, query.wait_ms)
        .await
        .map_err(internal_error)?;

    let body = match result {
        JobResultState::Done(result) => serde_json::json!({"status": "done", "result": result}),
        JobResultState::Pending => serde_json::json!({"status": "pending"}),
        JobResultState::Timeout => serde_json::json!({"status": "timeout"}),
    };
    Ok(Json(body))
}

// ============ POST /generate ============

#[derive(Deserialize)]
struct GenerateRequest {
    query: String,
    collection: String,
    #[serde(default = "default_generate_k")]
    k: usize,
    #[serde(default)]
    sources: Option<Vec<String>>,
    #[serde(default = "default_generate_temperature")]
    temperature: f32,
}

fn default_generate_k() -> usize {
    10
}

fn default_generate_temperature() -> f32 {
    0.5
}

async fn submit_generation(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let query_prefix: String = req.query.chars().take(50).collect();
    tracing::info!(query = %query_prefix, "submitting generation job");

    let message = state
        .queue
        .enqueue(
            QUEUE_GENERATION,
            crate::generate::ACTOR_GENERATE_ANSWER,
            serde_json::json!({
                "query": req.query,
                "collection": req.collection,
                "k": req.k,
                "sources": req.sources,
                "temperature": req.temperature,
            }),
        )
        .await
        .map_err(internal_error)?;

    Ok(Json(serde_json::json!({
        "job_id": message.message_id,
        "status": "pending",
        "message": "Generation job submitted successfully. Use job_id to check status.",
    })))
}

// ============ POST /generate/status ============

#[derive(Deserialize)]
struct GenerationStatusReq {
    job_id: String,
}

async fn generation_status(
    State(state): State<AppState>,
    Json(req): Json<GenerationStatusReq>,
) -> Result<Json<serde_json::Value>, AppError> {
    let result = state
        .queue
        .get_result(&req.job_id, 0)
        .await
        .map_err(internal_error)?;

    let body = match result {
        JobResultState::Done(result) => serde_json::json!({
            "job_id": req.job_id,
            "status": "completed",
            "result": result,
        }),
        _ => serde_json::json!({
            "job_id": req.job_id,
            "status": "pending",
            "message": "Job is still processing",
        }),
    };
    Ok(Json(body))
}

// ============ GET /generate/stream ============

#[derive(Deserialize)]
struct GenerateStreamQuery {
    query: String,
    collection: String,
    #[serde(default = "default_generate_k")]
    k: usize,
    /// Comma-separated source filter.
    #[serde(default)]
    sources: Option<String>,
    #[serde(default = "default_stream_temperature")]
    temperature: f32,
    #[serde(default = "default_stream_max_tokens")]
    max_tokens: u32,
}

fn default_stream_temperature() -> f32 {
    0.7
}

fn default_stream_max_tokens() -> u32 {
    2048
}

async fn generate_stream(
    State(state): State<AppState>,
    Query(req): Query<GenerateStreamQuery>,
) -> Result<impl IntoResponse, AppError> {
    // Caller-generated correlation id, so the subscriber can attach before
    // the worker publishes the first event.
    let nonce: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    let job_id = format!("stream-{}-{}", Utc::now().timestamp_millis(), nonce);

    let sources: Option<Vec<String>> = req.sources.as_deref().map(|csv| {
        csv.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    });

    let message = JobMessage {
        message_id: job_id.clone(),
        queue_name: QUEUE_GENERATION.to_string(),
        actor_name: ACTOR_GENERATE_ANSWER_STREAM.to_string(),
        kwargs: serde_json::json!({
            "job_id": job_id,
            "query": req.query,
            "collection": req.collection,
            "k": req.k,
            "sources": sources,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        }),
        retries: 0,
    };
    state.queue.push(&message).await.map_err(internal_error)?;
    tracing::info!(job_id = %job_id, "generation stream job enqueued");

    let stream_key = events::stream_key(&job_id);
    let mut conn = state.queue.manager();

    let event_stream = async_stream::stream! {
        let mut last_id = "0".to_string();
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(events::STREAM_TTL_SECONDS as u64);

        'outer: loop {
            if tokio::time::Instant::now() >= deadline {
                yield Ok::<Event, Infallible>(
                    Event::default()
                        .event("error")
                        .data(serde_json::json!({"error": "stream timed out"}).to_string()),
                );
                break;
            }

            let entries = match events::read_batch(&mut conn, &stream_key, &last_id).await {
                Ok(entries) => entries,
                Err(e) => {
                    yield Ok(Event::default()
                        .event("error")
                        .data(serde_json::json!({"error": e.to_string()}).to_string()));
                    break;
                }
            };

            for entry in entries {
                last_id = entry.id.clone();
                match entry.event_type.as_str() {
                    "token" => {
                        // Token payloads are JSON strings; fall back to the
                        // raw field for anything unexpected.
                        let token: String = serde_json::from_str(&entry.data)
                            .unwrap_or_else(|_| entry.data.clone());
                        yield Ok(Event::default()
                            .data(serde_json::json!({"token": token}).to_string()));
                    }
                    terminal @ ("done" | "error") => {
                        yield Ok(Event::default().event(terminal).data(entry.data.clone()));
                        break 'outer;
                    }
                    other => {
                        tracing::warn!(event_type = %other, "unknown stream event type, skipping");
                    }
                }
            }
        }
    };

    Ok((
        [
            ("cache-control", "no-cache"),
            ("connection", "keep-alive"),
            ("x-accel-buffering", "no"),
        ],
        Sse::new(event_stream),
    ))
}

// ============ GET /files/download ============

#[derive(Deserialize)]
struct DownloadQuery {
    key: String,
    #[serde(default = "default_download_expiry")]
    expires_in: u64,
}

fn default_download_expiry() -> u64 {
    600
}

#[derive(Serialize)]
struct DownloadUrlResponse {
    key: String,
    url: String,
    expires_in: u64,
}

async fn download_url(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<DownloadUrlResponse>, AppError> {
    if !query.key.starts_with("processed/") {
        return Err(bad_request("Invalid key prefix"));
    }
    if !(60..=3600).contains(&query.expires_in) {
        return Err(bad_request("expires_in must be between 60 and 3600"));
    }

    if !state
        .object_store
        .object_exists(&query.key)
        .await
        .map_err(internal_error)?
    {
        return Err(not_found("File not found"));
    }

    let url = state
        .object_store
        .presigned_get_url(&query.key, query.expires_in);
    tracing::info!(key = %query.key, "generated presigned download URL");

    Ok(Json(DownloadUrlResponse {
        key: query.key,
        url,
        expires_in: query.expires_in,
    }))
}

// ============ GET /collections/ ============

async fn list_collections(
    State(state): State<AppState>,
) -> Result<Json<Vec<String>>, AppError> {
    let collections = state
        .store
        .list_collections()
        .await
        .map_err(internal_error)?;
    Ok(Json(collections))
}

// ============ GET /health/ ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
