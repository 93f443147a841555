//! Core data types shared by every layer of the pipeline.
//!
//! Identifiers are newtypes so a `DocumentId` can never be passed where a
//! `TenantId` is expected. Every persisted entity carries its owning
//! [`TenantId`]; stores take the tenant as an explicit argument on every
//! read and reject an empty one.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

id_type!(
    /// The isolation boundary. Every other entity carries one.
    TenantId
);
id_type!(DocumentId);
id_type!(JobId);
id_type!(UserId);

impl TenantId {
    /// Fails with [`PipelineError::IsolationViolation`] when the tenant is
    /// blank. Stores call this before building any predicate.
    pub fn require(&self) -> Result<&str> {
        if self.0.trim().is_empty() {
            return Err(PipelineError::IsolationViolation(
                "query issued without a tenant predicate".to_string(),
            ));
        }
        Ok(&self.0)
    }
}

impl DocumentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

// ============ Task types ============

/// The closed set of processing stages. Adding a stage means adding a
/// variant here, and the compiler then points at every `match` that needs a
/// handler, a visibility deadline, and a status column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Extraction,
    Ocr,
    Summarization,
    /// Chunk, embed, and store for retrieval.
    Indexing,
    FormFilling,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::Extraction,
        TaskType::Ocr,
        TaskType::Summarization,
        TaskType::Indexing,
        TaskType::FormFilling,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Extraction => "extraction",
            TaskType::Ocr => "ocr",
            TaskType::Summarization => "summarization",
            TaskType::Indexing => "indexing",
            TaskType::FormFilling => "form_filling",
        }
    }

    /// Lease length proportional to the expected primitive latency.
    pub fn default_visibility(&self) -> Duration {
        let secs = match self {
            TaskType::Ocr => 120,
            TaskType::Extraction => 300,
            TaskType::Summarization => 900,
            TaskType::Indexing => 900,
            TaskType::FormFilling => 300,
        };
        Duration::from_secs(secs)
    }

    /// Whether results of this type go through human review.
    pub fn reviewable(&self) -> bool {
        !matches!(self, TaskType::Indexing)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "extraction" => Ok(TaskType::Extraction),
            "ocr" => Ok(TaskType::Ocr),
            "summarization" => Ok(TaskType::Summarization),
            "indexing" => Ok(TaskType::Indexing),
            "form_filling" | "form-filling" => Ok(TaskType::FormFilling),
            other => Err(PipelineError::MalformedInput(format!(
                "unknown task type '{}'; expected one of extraction, ocr, summarization, indexing, form_filling",
                other
            ))),
        }
    }
}

// ============ Status enums ============

macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = PipelineError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($s => Ok($name::$variant),)+
                    other => Err(PipelineError::MalformedInput(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Document lifecycle, rolled up from per-task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

str_enum!(DocumentStatus {
    Uploaded => "uploaded",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl DocumentStatus {
    /// Any pending or running task keeps the document `processing`; once
    /// everything settled a single failure marks it `failed`.
    pub fn roll_up<I: IntoIterator<Item = TaskState>>(states: I) -> Self {
        let mut any = false;
        let mut failed = false;
        for s in states {
            any = true;
            match s {
                TaskState::Pending | TaskState::Processing => return DocumentStatus::Processing,
                TaskState::Failed => failed = true,
                TaskState::Completed => {}
            }
        }
        if !any {
            DocumentStatus::Uploaded
        } else if failed {
            DocumentStatus::Failed
        } else {
            DocumentStatus::Completed
        }
    }
}

/// Per-(document, task type) state, visible independently of other tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
}

str_enum!(TaskState {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InFlight,
    Done,
    FailedPermanent,
}

str_enum!(JobStatus {
    Pending => "pending",
    InFlight => "in_flight",
    Done => "done",
    FailedPermanent => "failed_permanent",
});

// ============ Blob locators ============

/// Relative, path-addressed location of a blob in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobLocator(String);

impl BlobLocator {
    /// Parses a locator, rejecting absolute paths and `..` segments.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::MalformedInput("empty blob locator".into()));
        }
        if trimmed.starts_with('/') || trimmed.contains('\\') {
            return Err(PipelineError::MalformedInput(format!(
                "blob locator must be relative: {}",
                s
            )));
        }
        if trimmed
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(PipelineError::MalformedInput(format!(
                "invalid blob locator: {}",
                s
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Raw upload location: `tenants/<t>/documents/<d>/<filename>`.
    pub fn for_upload(tenant: &TenantId, document: &DocumentId, filename: &str) -> Result<Self> {
        let name = sanitize_segment(filename);
        Self::parse(&format!("tenants/{}/documents/{}/{}", tenant, document, name))
    }

    /// Location of a derived artifact produced by a worker.
    pub fn for_derived(tenant: &TenantId, document: &DocumentId, name: &str) -> Result<Self> {
        let name = sanitize_segment(name);
        Self::parse(&format!(
            "tenants/{}/documents/{}/derived/{}",
            tenant, document, name
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sanitize_segment(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "blob".to_string()
    } else {
        cleaned
    }
}

// ============ Documents ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub filename: String,
    pub mime_type: String,
    pub storage_locator: BlobLocator,
    pub size_bytes: i64,
    pub content_sha256: String,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Document {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// State of one task type for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_type: TaskType,
    pub state: TaskState,
    pub job_id: Option<JobId>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ============ Jobs ============

/// A job row as the queue sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub storage_locator: BlobLocator,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    pub visibility_deadline: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dedup_key: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingJob {
    /// The wire form handed to a worker's entry point.
    pub fn message(&self) -> JobMessage {
        JobMessage {
            job_id: self.job_id.clone(),
            tenant_id: self.tenant_id.clone(),
            document_id: self.document_id.clone(),
            task_type: self.task_type,
            storage_locator: self.storage_locator.clone(),
            attempt_count: self.attempt_count,
            enqueued_at: self.enqueued_at,
            payload: self.payload.clone(),
        }
    }
}

/// Everything needed to put a job on the queue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub storage_locator: BlobLocator,
    pub max_attempts: u32,
    pub dedup_key: Option<String>,
}

/// Queue payload. Additive-only: unknown fields are ignored on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub task_type: TaskType,
    pub storage_locator: BlobLocator,
    #[serde(default)]
    pub attempt_count: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl JobMessage {
    /// Reads a string option from the payload, e.g. `summary_type`.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// Exclusive (but not exactly-once) custody of a job until `deadline`.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: ProcessingJob,
    pub token: String,
    pub deadline: DateTime<Utc>,
}

/// A job that exhausted its attempts or failed permanently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub error: String,
    pub dead_lettered_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

// ============ Chunks ============

/// A bounded span of document text plus its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: String,
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    pub token_count: usize,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub embedding_version: crate::embedding::EmbeddingVersion,
    /// Incremented every time the document's chunk set is replaced.
    pub generation: i64,
    pub metadata: serde_json::Value,
}

/// A chunk returned from a vector search, with its cosine score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub chunk_index: i64,
    pub text: String,
    pub score: f32,
}

// ============ Audit ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    DocumentUploaded,
    DocumentDeleted,
    JobEnqueued,
    TaskStarted,
    TaskCompleted,
    TaskRetried,
    TaskFailed,
    JobSkipped,
    JobDeadLettered,
    JobReplayed,
    ChunksReplaced,
    ResultCorrected,
    ResultReviewed,
    ResultValidated,
    ResultRejected,
}

str_enum!(AuditAction {
    DocumentUploaded => "document_uploaded",
    DocumentDeleted => "document_deleted",
    JobEnqueued => "job_enqueued",
    TaskStarted => "task_started",
    TaskCompleted => "task_completed",
    TaskRetried => "task_retried",
    TaskFailed => "task_failed",
    JobSkipped => "job_skipped",
    JobDeadLettered => "job_dead_lettered",
    JobReplayed => "job_replayed",
    ChunksReplaced => "chunks_replaced",
    ResultCorrected => "result_corrected",
    ResultReviewed => "result_reviewed",
    ResultValidated => "result_validated",
    ResultRejected => "result_rejected",
});

impl AuditAction {
    /// Actions recorded at most once per job, so a redelivered job does not
    /// duplicate them. Failure and retry entries follow a successful nack,
    /// which the lease token already makes unique.
    pub fn once_per_job(&self) -> bool {
        matches!(
            self,
            AuditAction::JobEnqueued
                | AuditAction::TaskCompleted
                | AuditAction::JobSkipped
                | AuditAction::ChunksReplaced
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub document_id: Option<DocumentId>,
    pub job_id: Option<JobId>,
    pub task_type: Option<TaskType>,
    pub action: AuditAction,
    pub details: serde_json::Value,
}

impl NewAuditEntry {
    pub fn new(tenant_id: &TenantId, action: AuditAction) -> Self {
        Self {
            tenant_id: tenant_id.clone(),
            user_id: None,
            document_id: None,
            job_id: None,
            task_type: None,
            action,
            details: serde_json::json!({}),
        }
    }

    pub fn document(mut self, id: &DocumentId) -> Self {
        self.document_id = Some(id.clone());
        self
    }

    pub fn job(mut self, id: &JobId, task_type: TaskType) -> Self {
        self.job_id = Some(id.clone());
        self.task_type = Some(task_type);
        self
    }

    pub fn task(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn user(mut self, id: &UserId) -> Self {
        self.user_id = Some(id.clone());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// A persisted, immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub document_id: Option<DocumentId>,
    pub job_id: Option<JobId>,
    pub task_type: Option<TaskType>,
    pub action: AuditAction,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Date-range filter for the append-only audit scan.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub document_id: Option<DocumentId>,
    pub limit: Option<usize>,
}
