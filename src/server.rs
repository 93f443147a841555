//! HTTP API.
//!
//! Every data route is scoped under `/v1/tenants/{tenant}`; the tenant path
//! segment is passed to the store as the isolation predicate on every
//! call. Authentication sits in front of this server and is not handled
//! here.
//!
//! # Endpoints
//!
//! | Method | Path (under `/v1/tenants/{tenant}`) | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Upload (`content_base64`) |
//! | `GET`  | `/documents/{id}` | Document plus per-task status |
//! | `DELETE` | `/documents/{id}` | Soft delete; queued jobs become no-ops |
//! | `POST` | `/documents/{id}/jobs` | Enqueue a task |
//! | `GET`  | `/jobs/{job_id}` | Job state |
//! | `GET`  | `/documents/{id}/results/{task_type}` | Effective result view |
//! | `POST` | `/documents/{id}/results/{task_type}/review` | Review action |
//! | `POST` | `/query` | Grounded question answering |
//! | `GET`  | `/audit` | Audit scan (`from`, `to`, `document_id`, `limit`) |
//! | `GET`  | `/dead-letters` | Dead letters, newest first |
//! | `POST` | `/dead-letters/{id}/replay` | Operator replay |
//!
//! `GET /health` sits outside the tenant scope.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document not found: 42" } }
//! ```
//!
//! Error codes: `bad_request` (400), `isolation_violation` (403),
//! `not_found` (404), `conflict` (409), `internal` (500),
//! `unavailable` (503).

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use docflow_core::intake::{DocumentView, Upload};
use docflow_core::models::{
    AuditEntry, AuditQuery, DeadLetter, Document, DocumentId, JobId, ProcessingJob, TaskType,
    TenantId, UserId,
};
use docflow_core::retrieval::{QueryRequest, QueryResponse};
use docflow_core::review::{EffectiveResult, ReviewAction};
use docflow_core::{Pipeline, PipelineError};

use crate::config::Config;

/// Uploads arrive base64-encoded inside JSON.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
}

/// Opens the pipeline described by `config` and serves it on `[server].bind`
/// until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = crate::open_pipeline(config).await?;
    serve(pipeline, &config.server.bind).await
}

/// Serve an already-wired pipeline. Integration tests use this with test
/// primitives.
pub async fn serve(pipeline: Pipeline, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(bind = %bind, "docflow server listening");
    println!("docflow server listening on http://{}", bind);
    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

pub fn router(pipeline: Pipeline) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/tenants/{tenant}/documents", post(handle_upload))
        .route(
            "/v1/tenants/{tenant}/documents/{id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route("/v1/tenants/{tenant}/documents/{id}/jobs", post(handle_enqueue))
        .route("/v1/tenants/{tenant}/jobs/{job_id}", get(handle_get_job))
        .route(
            "/v1/tenants/{tenant}/documents/{id}/results/{task_type}",
            get(handle_get_result),
        )
        .route(
            "/v1/tenants/{tenant}/documents/{id}/results/{task_type}/review",
            post(handle_review),
        )
        .route("/v1/tenants/{tenant}/query", post(handle_query))
        .route("/v1/tenants/{tenant}/audit", get(handle_audit))
        .route("/v1/tenants/{tenant}/dead-letters", get(handle_dead_letters))
        .route(
            "/v1/tenants/{tenant}/dead-letters/{id}/replay",
            post(handle_replay),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(AppState { pipeline })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        let (status, code) = match &e {
            PipelineError::MalformedInput(_) | PipelineError::EmbeddingVersionMismatch { .. } => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            PipelineError::IsolationViolation(_) => {
                (StatusCode::FORBIDDEN, "isolation_violation")
            }
            PipelineError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            PipelineError::InvalidTransition(_) => (StatusCode::CONFLICT, "conflict"),
            PipelineError::TransientIo(_)
            | PipelineError::QueueUnavailable(_)
            | PipelineError::QuotaExceeded(_)
            | PipelineError::Config(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            PipelineError::LeaseLost(_) | PipelineError::Rejected(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        if status.is_server_error() {
            tracing::warn!(code, error = %e, "request failed");
        }
        AppError {
            status,
            code,
            message: e.to_string(),
        }
    }
}

type ApiResult<T> = Result<T, AppError>;

fn task_type(raw: &str) -> ApiResult<TaskType> {
    raw.parse::<TaskType>().map_err(AppError::from)
}

/// Actor recorded in audit entries when the caller names none.
fn actor(user_id: Option<String>) -> UserId {
    UserId::new(user_id.unwrap_or_else(|| "api".to_string()))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Documents ============

#[derive(Deserialize)]
struct UploadBody {
    filename: String,
    mime_type: String,
    user_id: String,
    content_base64: String,
}

async fn handle_upload(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(body): Json<UploadBody>,
) -> ApiResult<(StatusCode, Json<Document>)> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body.content_base64.trim())
        .map_err(|e| bad_request(format!("content_base64 is not valid base64: {}", e)))?;
    let doc = state
        .pipeline
        .intake()
        .upload(Upload {
            tenant_id: TenantId::new(tenant),
            user_id: UserId::new(body.user_id),
            filename: body.filename,
            mime_type: body.mime_type,
            bytes,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<Json<DocumentView>> {
    let view = state
        .pipeline
        .intake()
        .describe(&TenantId::new(tenant), &DocumentId::new(id))
        .await?;
    Ok(Json(view))
}

#[derive(Deserialize)]
struct ActorParams {
    user_id: Option<String>,
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    Query(params): Query<ActorParams>,
) -> ApiResult<Json<DocumentView>> {
    let tenant = TenantId::new(tenant);
    let id = DocumentId::new(id);
    let intake = state.pipeline.intake();
    intake.delete(&tenant, &id, &actor(params.user_id)).await?;
    Ok(Json(intake.describe(&tenant, &id).await?))
}

// ============ Jobs ============

#[derive(Deserialize)]
struct EnqueueBody {
    task_type: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct EnqueueResponse {
    job_id: JobId,
}

async fn handle_enqueue(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    Json(body): Json<EnqueueBody>,
) -> ApiResult<(StatusCode, Json<EnqueueResponse>)> {
    let task_type = task_type(&body.task_type)?;
    let payload = body.payload.unwrap_or_else(|| serde_json::json!({}));
    if !payload.is_object() {
        return Err(bad_request("payload must be a JSON object"));
    }
    let job_id = state
        .pipeline
        .dispatcher()
        .enqueue(&TenantId::new(tenant), &DocumentId::new(id), task_type, payload)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { job_id })))
}

async fn handle_get_job(
    State(state): State<AppState>,
    Path((tenant, job_id)): Path<(String, String)>,
) -> ApiResult<Json<ProcessingJob>> {
    let job = state
        .pipeline
        .dispatcher()
        .get_job(&TenantId::new(tenant), &JobId::new(job_id))
        .await?;
    Ok(Json(job))
}

// ============ Results & review ============

async fn handle_get_result(
    State(state): State<AppState>,
    Path((tenant, id, task)): Path<(String, String, String)>,
) -> ApiResult<Json<EffectiveResult>> {
    let view = state
        .pipeline
        .reviews()
        .effective(&TenantId::new(tenant), &DocumentId::new(id), task_type(&task)?)
        .await?;
    Ok(Json(view))
}

#[derive(Deserialize)]
struct ReviewBody {
    user_id: String,
    #[serde(flatten)]
    action: ReviewAction,
}

async fn handle_review(
    State(state): State<AppState>,
    Path((tenant, id, task)): Path<(String, String, String)>,
    Json(body): Json<ReviewBody>,
) -> ApiResult<Json<EffectiveResult>> {
    if body.user_id.trim().is_empty() {
        return Err(bad_request("user_id must not be empty"));
    }
    let view = state
        .pipeline
        .reviews()
        .apply(
            &TenantId::new(tenant),
            &DocumentId::new(id),
            task_type(&task)?,
            &body.action,
            &UserId::new(body.user_id),
        )
        .await?;
    Ok(Json(view))
}

// ============ Query ============

#[derive(Deserialize)]
struct QueryBody {
    question: String,
    #[serde(default)]
    document_ids: Option<Vec<DocumentId>>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    embedding_model: Option<String>,
}

async fn handle_query(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(body): Json<QueryBody>,
) -> ApiResult<Json<QueryResponse>> {
    let request = QueryRequest {
        tenant_id: TenantId::new(tenant),
        question: body.question,
        document_ids: body.document_ids,
        top_k: body.top_k,
        embedding_model: body.embedding_model,
    };
    Ok(Json(state.pipeline.query_engine().query(&request).await?))
}

// ============ Audit ============

#[derive(Deserialize)]
struct AuditParams {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    document_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct AuditResponse {
    entries: Vec<AuditEntry>,
}

async fn handle_audit(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(params): Query<AuditParams>,
) -> ApiResult<Json<AuditResponse>> {
    let query = AuditQuery {
        from: params.from,
        to: params.to,
        document_id: params.document_id.map(DocumentId::new),
        limit: params.limit,
    };
    let entries = state
        .pipeline
        .store
        .audit_log(&TenantId::new(tenant), &query)
        .await?;
    Ok(Json(AuditResponse { entries }))
}

// ============ Dead letters ============

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct DeadLettersResponse {
    dead_letters: Vec<DeadLetter>,
}

async fn handle_dead_letters(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<DeadLettersResponse>> {
    let dead_letters = state
        .pipeline
        .dispatcher()
        .dead_letters(
            &TenantId::new(tenant),
            params.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        )
        .await?;
    Ok(Json(DeadLettersResponse { dead_letters }))
}

async fn handle_replay(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    Query(params): Query<ActorParams>,
) -> ApiResult<Json<ProcessingJob>> {
    let actor = params.user_id.map(UserId::new);
    let job = state
        .pipeline
        .dispatcher()
        .replay(&TenantId::new(tenant), &id, actor.as_ref())
        .await?;
    Ok(Json(job))
}
