//! Structured-store abstraction.
//!
//! The [`Store`] trait is the single shared mutable resource of the
//! pipeline: documents, per-task status, results, corrections, chunks, and
//! the audit log. Every method that reads tenant data takes an explicit
//! [`TenantId`]; implementations must put that tenant into the predicate of
//! the query itself (never filter afterwards) and fail with
//! [`PipelineError::IsolationViolation`](crate::PipelineError) when the
//! tenant is blank.
//!
//! Every write is keyed by a natural key and transactional, so a worker
//! re-executing a redelivered job converges on the same final state.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`insert_document`](Store::insert_document) | Record an uploaded document |
//! | [`get_document`](Store::get_document) | Tenant-scoped document lookup |
//! | [`set_task_state`](Store::set_task_state) | Per-task status + document roll-up |
//! | [`mark_task_pending`](Store::mark_task_pending) | Guarded move back to `pending` |
//! | [`commit_task`](Store::commit_task) | Idempotent result upsert + completion |
//! | [`get_result`](Store::get_result) | `GetResult(tenant, document, task)` |
//! | [`apply_review`](Store::apply_review) | Correction overlay / review transition |
//! | [`replace_chunks`](Store::replace_chunks) | Atomic chunk-set replacement |
//! | [`vector_search`](Store::vector_search) | Tenant-filtered cosine search |
//! | [`append_audit`](Store::append_audit) | Append-only audit write |
//! | [`audit_log`](Store::audit_log) | Tenant/date-range audit scan |

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::EmbeddingVersion;
use crate::error::Result;
use crate::models::{
    AuditEntry, AuditQuery, Document, DocumentChunk, DocumentId, DocumentStatus, JobId,
    NewAuditEntry, ScoredChunk, TaskState, TaskStatus, TaskType, TenantId, UserId,
};
use crate::results::{Correction, StoredResult, TaskCommit, UpsertOutcome};
use crate::review::ReviewAction;

/// Inputs to a nearest-neighbour search.
#[derive(Debug, Clone)]
pub struct VectorQuery<'a> {
    pub tenant_id: &'a TenantId,
    pub vector: &'a [f32],
    /// Only chunks stamped with this version are compared.
    pub version: &'a EmbeddingVersion,
    pub document_ids: Option<&'a [DocumentId]>,
    pub limit: usize,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, tenant: &TenantId, id: &DocumentId) -> Result<Option<Document>>;

    async fn list_documents(&self, tenant: &TenantId, limit: usize) -> Result<Vec<Document>>;

    /// Soft-delete. Returns `false` if the document was absent or already
    /// deleted.
    async fn mark_document_deleted(
        &self,
        tenant: &TenantId,
        id: &DocumentId,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn task_statuses(&self, tenant: &TenantId, id: &DocumentId) -> Result<Vec<TaskStatus>>;

    /// Set one task's state and return the rolled-up document status.
    async fn set_task_state(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
        state: TaskState,
        job_id: Option<&JobId>,
        error: Option<&str>,
    ) -> Result<DocumentStatus>;

    /// Mark `job_id`'s task `pending`, unless a worker has already moved
    /// that job past `pending`. The write applies when the row is absent,
    /// records another job, or records `job_id` in one of `from`
    /// (see [`pending_write_applies`]). Returns `None` when it was skipped.
    async fn mark_task_pending(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
        job_id: &JobId,
        from: &[TaskState],
        error: Option<&str>,
    ) -> Result<Option<DocumentStatus>>;

    /// Upsert the result keyed by `(document_id, task_type)`, mark the task
    /// `completed`, and write a `task_completed` audit entry, all in one
    /// transaction.
    ///
    /// A commit from the job that already wrote the row is a no-op
    /// ([`UpsertOutcome::Unchanged`]); its audit entry is not duplicated.
    async fn commit_task(&self, commit: &TaskCommit) -> Result<UpsertOutcome>;

    async fn get_result(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
    ) -> Result<Option<StoredResult>>;

    async fn corrections(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
    ) -> Result<Vec<Correction>>;

    /// Apply a review action: append a correction (if any), move the review
    /// state, and write the audit entry atomically.
    async fn apply_review(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
        action: &ReviewAction,
        actor: &UserId,
    ) -> Result<StoredResult>;

    /// Replace a document's chunk set in one transaction and return its
    /// generation. An identical chunk set (same ids, same order) is left in
    /// place and its current generation returned.
    async fn replace_chunks(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        chunks: &[DocumentChunk],
    ) -> Result<i64>;

    /// Current chunk set ordered by `chunk_index`.
    async fn chunks_for_document(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
    ) -> Result<Vec<DocumentChunk>>;

    /// Distinct embedding versions of the tenant's chunks in scope.
    async fn embedding_versions(
        &self,
        tenant: &TenantId,
        document_ids: Option<&[DocumentId]>,
    ) -> Result<Vec<EmbeddingVersion>>;

    /// Highest-scoring chunks first; ties broken by document id then index.
    async fn vector_search(&self, query: &VectorQuery<'_>) -> Result<Vec<ScoredChunk>>;

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<()>;

    async fn audit_log(&self, tenant: &TenantId, query: &AuditQuery) -> Result<Vec<AuditEntry>>;
}

/// Sort comparator shared by store implementations.
pub fn rank_scored(a: &ScoredChunk, b: &ScoredChunk) -> std::cmp::Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.document_id.cmp(&b.document_id))
        .then_with(|| a.chunk_index.cmp(&b.chunk_index))
}

/// Whether a `pending` write for `job_id` may replace `current`, the row's
/// `(state, job_id)`.
pub fn pending_write_applies(
    current: Option<(TaskState, Option<&str>)>,
    job_id: &JobId,
    from: &[TaskState],
) -> bool {
    match current {
        Some((state, Some(current_job))) if current_job == job_id.as_str() => from.contains(&state),
        _ => true,
    }
}

/// Dedup key for audit actions recorded at most once per job.
pub fn audit_dedup_key(entry: &NewAuditEntry) -> Option<String> {
    match (&entry.job_id, entry.action.once_per_job()) {
        (Some(job), true) => Some(format!("{}:{}", job, entry.action)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_write_never_rewinds_a_job_that_moved_on() {
        let job = JobId::from("j1");
        let from = [TaskState::Pending];
        assert!(pending_write_applies(None, &job, &from));
        assert!(pending_write_applies(Some((TaskState::Completed, Some("j0"))), &job, &from));
        assert!(pending_write_applies(Some((TaskState::Pending, Some("j1"))), &job, &from));
        assert!(!pending_write_applies(Some((TaskState::Processing, Some("j1"))), &job, &from));
        assert!(!pending_write_applies(Some((TaskState::Completed, Some("j1"))), &job, &from));
        assert!(pending_write_applies(
            Some((TaskState::Failed, Some("j1"))),
            &job,
            &[TaskState::Failed]
        ));
    }
}
