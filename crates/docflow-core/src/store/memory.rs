//! In-memory [`Store`] implementation for tests and embedding.
//!
//! All state sits behind a single `std::sync::RwLock`, so every trait method
//! is atomic with respect to every other, the same guarantee the SQLite
//! store gets from a transaction. Vector search is brute-force cosine
//! similarity over the tenant's chunks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::{cosine_similarity, EmbeddingVersion};
use crate::error::{PipelineError, Result};
use crate::models::{
    AuditAction, AuditEntry, AuditQuery, Document, DocumentChunk, DocumentId, DocumentStatus,
    JobId, NewAuditEntry, ScoredChunk, TaskState, TaskStatus, TaskType, TenantId, UserId,
};
use crate::results::{
    completion_details, Correction, ReviewState, StoredResult, TaskCommit, UpsertOutcome,
};
use crate::review::{check_action, ReviewAction};

use super::{audit_dedup_key, pending_write_applies, rank_scored, Store, VectorQuery};

type DocKey = (TenantId, DocumentId);
type ResultKey = (TenantId, DocumentId, TaskType);

struct ChunkSet {
    generation: i64,
    chunks: Vec<DocumentChunk>,
}

#[derive(Default)]
struct Inner {
    documents: HashMap<DocKey, Document>,
    tasks: HashMap<DocKey, BTreeMap<TaskType, TaskStatus>>,
    results: HashMap<ResultKey, StoredResult>,
    corrections: HashMap<ResultKey, Vec<Correction>>,
    chunks: HashMap<DocKey, ChunkSet>,
    audit: Vec<AuditEntry>,
    audit_keys: HashSet<String>,
    next_correction_id: i64,
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| PipelineError::TransientIo("store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| PipelineError::TransientIo("store lock poisoned".to_string()))
    }
}

impl Inner {
    fn owned_document(&self, tenant: &TenantId, id: &DocumentId) -> Result<&Document> {
        if let Some(doc) = self.documents.get(&(tenant.clone(), id.clone())) {
            return Ok(doc);
        }
        if self.documents.keys().any(|(_, d)| d == id) {
            return Err(PipelineError::IsolationViolation(format!(
                "document {} does not belong to tenant {}",
                id, tenant
            )));
        }
        Err(PipelineError::not_found("document", id))
    }

    fn append_audit(&mut self, entry: &NewAuditEntry) {
        if let Some(key) = audit_dedup_key(entry) {
            if !self.audit_keys.insert(key) {
                return;
            }
        }
        let id = self.audit.len() as i64 + 1;
        self.audit.push(AuditEntry {
            id,
            tenant_id: entry.tenant_id.clone(),
            user_id: entry.user_id.clone(),
            document_id: entry.document_id.clone(),
            job_id: entry.job_id.clone(),
            task_type: entry.task_type,
            action: entry.action,
            details: entry.details.clone(),
            created_at: Utc::now(),
        });
    }

    fn set_task_state(
        &mut self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
        state: TaskState,
        job_id: Option<&JobId>,
        error: Option<&str>,
    ) -> Result<DocumentStatus> {
        self.owned_document(tenant, document)?;
        let key = (tenant.clone(), document.clone());
        let now = Utc::now();
        let tasks = self.tasks.entry(key.clone()).or_default();
        let previous_job = tasks.get(&task_type).and_then(|t| t.job_id.clone());
        tasks.insert(
            task_type,
            TaskStatus {
                task_type,
                state,
                job_id: job_id.cloned().or(previous_job),
                error: error.map(|e| e.to_string()),
                updated_at: now,
            },
        );
        let status = DocumentStatus::roll_up(tasks.values().map(|t| t.state));
        if let Some(doc) = self.documents.get_mut(&key) {
            doc.status = status;
            doc.updated_at = now;
        }
        Ok(status)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        doc.tenant_id.require()?;
        let mut inner = self.write()?;
        if inner.documents.keys().any(|(_, d)| d == &doc.id) {
            return Err(PipelineError::MalformedInput(format!(
                "document {} already exists",
                doc.id
            )));
        }
        inner
            .documents
            .insert((doc.tenant_id.clone(), doc.id.clone()), doc.clone());
        Ok(())
    }

    async fn get_document(&self, tenant: &TenantId, id: &DocumentId) -> Result<Option<Document>> {
        tenant.require()?;
        let inner = self.read()?;
        Ok(inner.documents.get(&(tenant.clone(), id.clone())).cloned())
    }

    async fn list_documents(&self, tenant: &TenantId, limit: usize) -> Result<Vec<Document>> {
        tenant.require()?;
        let inner = self.read()?;
        let mut docs: Vec<Document> = inner
            .documents
            .iter()
            .filter(|((t, _), _)| t == tenant)
            .map(|(_, d)| d.clone())
            .collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        docs.truncate(limit);
        Ok(docs)
    }

    async fn mark_document_deleted(
        &self,
        tenant: &TenantId,
        id: &DocumentId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        tenant.require()?;
        let mut inner = self.write()?;
        match inner.documents.get_mut(&(tenant.clone(), id.clone())) {
            Some(doc) if doc.deleted_at.is_none() => {
                doc.deleted_at = Some(at);
                doc.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn task_statuses(&self, tenant: &TenantId, id: &DocumentId) -> Result<Vec<TaskStatus>> {
        tenant.require()?;
        let inner = self.read()?;
        Ok(inner
            .tasks
            .get(&(tenant.clone(), id.clone()))
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_task_state(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
        state: TaskState,
        job_id: Option<&JobId>,
        error: Option<&str>,
    ) -> Result<DocumentStatus> {
        tenant.require()?;
        let mut inner = self.write()?;
        inner.set_task_state(tenant, document, task_type, state, job_id, error)
    }

    async fn mark_task_pending(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
        job_id: &JobId,
        from: &[TaskState],
        error: Option<&str>,
    ) -> Result<Option<DocumentStatus>> {
        tenant.require()?;
        let mut inner = self.write()?;
        let current = inner
            .tasks
            .get(&(tenant.clone(), document.clone()))
            .and_then(|tasks| tasks.get(&task_type))
            .map(|t| (t.state, t.job_id.as_ref().map(|j| j.as_str())));
        if !pending_write_applies(current, job_id, from) {
            return Ok(None);
        }
        inner
            .set_task_state(tenant, document, task_type, TaskState::Pending, Some(job_id), error)
            .map(Some)
    }

    async fn commit_task(&self, commit: &TaskCommit) -> Result<UpsertOutcome> {
        commit.tenant_id.require()?;
        let mut inner = self.write()?;
        inner.owned_document(&commit.tenant_id, &commit.document_id)?;

        let task_type = commit.task_type();
        let key = (
            commit.tenant_id.clone(),
            commit.document_id.clone(),
            task_type,
        );
        let now = Utc::now();
        let previous = inner.results.get(&key).cloned();
        let outcome = match inner.results.get(&key) {
            Some(existing) if existing.job_id == commit.job_id => UpsertOutcome::Unchanged,
            Some(existing) if existing.review_state != ReviewState::Extracted => {
                UpsertOutcome::Frozen
            }
            existing => {
                let created_at = existing.map(|e| e.created_at).unwrap_or(now);
                let outcome = if existing.is_some() {
                    UpsertOutcome::Superseded
                } else {
                    UpsertOutcome::Inserted
                };
                inner.results.insert(
                    key,
                    StoredResult {
                        tenant_id: commit.tenant_id.clone(),
                        document_id: commit.document_id.clone(),
                        task_type,
                        job_id: commit.job_id.clone(),
                        output: commit.output.clone(),
                        confidence: commit.output.confidence(),
                        model_used: commit.output.model_used().map(str::to_string),
                        review_state: ReviewState::Extracted,
                        created_at,
                        updated_at: now,
                    },
                );
                outcome
            }
        };

        inner.set_task_state(
            &commit.tenant_id,
            &commit.document_id,
            task_type,
            TaskState::Completed,
            Some(&commit.job_id),
            None,
        )?;
        inner.append_audit(
            &NewAuditEntry::new(&commit.tenant_id, AuditAction::TaskCompleted)
                .document(&commit.document_id)
                .job(&commit.job_id, task_type)
                .details(completion_details(outcome, previous.as_ref())),
        );
        Ok(outcome)
    }

    async fn get_result(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
    ) -> Result<Option<StoredResult>> {
        tenant.require()?;
        let inner = self.read()?;
        Ok(inner
            .results
            .get(&(tenant.clone(), document.clone(), task_type))
            .cloned())
    }

    async fn corrections(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
    ) -> Result<Vec<Correction>> {
        tenant.require()?;
        let inner = self.read()?;
        Ok(inner
            .corrections
            .get(&(tenant.clone(), document.clone(), task_type))
            .cloned()
            .unwrap_or_default())
    }

    async fn apply_review(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
        action: &ReviewAction,
        actor: &UserId,
    ) -> Result<StoredResult> {
        tenant.require()?;
        let mut inner = self.write()?;
        let key = (tenant.clone(), document.clone(), task_type);
        let current = inner
            .results
            .get(&key)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("result", format!("{}/{}", document, task_type)))?;
        let next = check_action(&current, action)?;
        let now = Utc::now();

        if let ReviewAction::Correct { field, value, note } = action {
            inner.next_correction_id += 1;
            let id = inner.next_correction_id;
            inner.corrections.entry(key.clone()).or_default().push(Correction {
                id,
                field: field.clone(),
                value: value.clone(),
                corrected_by: actor.clone(),
                note: note.clone(),
                created_at: now,
            });
        }

        let updated = {
            let row = inner
                .results
                .get_mut(&key)
                .ok_or_else(|| PipelineError::not_found("result", document))?;
            row.review_state = next;
            row.updated_at = now;
            row.clone()
        };
        inner.append_audit(
            &NewAuditEntry::new(tenant, action.audit_action())
                .document(document)
                .task(task_type)
                .user(actor)
                .details(action.audit_details(current.review_state, next)),
        );
        Ok(updated)
    }

    async fn replace_chunks(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        chunks: &[DocumentChunk],
    ) -> Result<i64> {
        tenant.require()?;
        for c in chunks {
            if &c.tenant_id != tenant || &c.document_id != document {
                return Err(PipelineError::IsolationViolation(format!(
                    "chunk {} does not belong to {}/{}",
                    c.chunk_id, tenant, document
                )));
            }
        }
        let mut inner = self.write()?;
        inner.owned_document(tenant, document)?;
        let key = (tenant.clone(), document.clone());

        let current_generation = inner.chunks.get(&key).map(|s| s.generation).unwrap_or(0);
        if let Some(existing) = inner.chunks.get(&key) {
            let same = existing.chunks.len() == chunks.len()
                && existing
                    .chunks
                    .iter()
                    .zip(chunks)
                    .all(|(a, b)| a.chunk_id == b.chunk_id && a.chunk_index == b.chunk_index);
            if same {
                return Ok(current_generation);
            }
        }

        let generation = current_generation + 1;
        let mut fresh: Vec<DocumentChunk> = chunks
            .iter()
            .cloned()
            .map(|mut c| {
                c.generation = generation;
                c
            })
            .collect();
        fresh.sort_by_key(|c| c.chunk_index);
        inner.chunks.insert(
            key,
            ChunkSet {
                generation,
                chunks: fresh,
            },
        );
        Ok(generation)
    }

    async fn chunks_for_document(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
    ) -> Result<Vec<DocumentChunk>> {
        tenant.require()?;
        let inner = self.read()?;
        Ok(inner
            .chunks
            .get(&(tenant.clone(), document.clone()))
            .map(|s| s.chunks.clone())
            .unwrap_or_default())
    }

    async fn embedding_versions(
        &self,
        tenant: &TenantId,
        document_ids: Option<&[DocumentId]>,
    ) -> Result<Vec<EmbeddingVersion>> {
        tenant.require()?;
        let inner = self.read()?;
        let mut versions: Vec<EmbeddingVersion> = Vec::new();
        for ((t, d), set) in &inner.chunks {
            if t != tenant || document_ids.is_some_and(|ids| !ids.contains(d)) {
                continue;
            }
            for c in &set.chunks {
                if !versions.contains(&c.embedding_version) {
                    versions.push(c.embedding_version.clone());
                }
            }
        }
        Ok(versions)
    }

    async fn vector_search(&self, query: &VectorQuery<'_>) -> Result<Vec<ScoredChunk>> {
        query.tenant_id.require()?;
        let inner = self.read()?;
        let mut scored: Vec<ScoredChunk> = inner
            .chunks
            .iter()
            .filter(|((t, d), _)| {
                t == query.tenant_id && query.document_ids.is_none_or(|ids| ids.contains(d))
            })
            .flat_map(|(_, set)| set.chunks.iter())
            .filter(|c| &c.embedding_version == query.version)
            .map(|c| ScoredChunk {
                chunk_id: c.chunk_id.clone(),
                tenant_id: c.tenant_id.clone(),
                document_id: c.document_id.clone(),
                chunk_index: c.chunk_index,
                text: c.text.clone(),
                score: cosine_similarity(query.vector, &c.embedding),
            })
            .collect();
        scored.sort_by(rank_scored);
        scored.truncate(query.limit);
        Ok(scored)
    }

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<()> {
        entry.tenant_id.require()?;
        let mut inner = self.write()?;
        inner.append_audit(entry);
        Ok(())
    }

    async fn audit_log(&self, tenant: &TenantId, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        tenant.require()?;
        let inner = self.read()?;
        let limit = query.limit.unwrap_or(100);
        Ok(inner
            .audit
            .iter()
            .filter(|e| &e.tenant_id == tenant)
            .filter(|e| query.from.is_none_or(|f| e.created_at >= f))
            .filter(|e| query.to.is_none_or(|t| e.created_at <= t))
            .filter(|e| {
                query
                    .document_id
                    .as_ref()
                    .is_none_or(|d| e.document_id.as_ref() == Some(d))
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{OcrOutput, TaskOutput};
    use crate::testing::{chunk, document};

    fn ocr_commit(doc: &Document, job: &str, text: &str) -> TaskCommit {
        TaskCommit {
            tenant_id: doc.tenant_id.clone(),
            document_id: doc.id.clone(),
            job_id: JobId::from(job),
            output: TaskOutput::Ocr(OcrOutput {
                text: text.into(),
                confidence: 0.9,
                page_count: 1,
                method: "native".into(),
            }),
        }
    }

    #[tokio::test]
    async fn commit_is_idempotent_per_job() {
        let store = InMemoryStore::new();
        let doc = document("t1", "d1");
        store.insert_document(&doc).await.unwrap();

        let first = store.commit_task(&ocr_commit(&doc, "j1", "hello")).await.unwrap();
        let again = store.commit_task(&ocr_commit(&doc, "j1", "different")).await.unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(again, UpsertOutcome::Unchanged);

        let row = store
            .get_result(&doc.tenant_id, &doc.id, TaskType::Ocr)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.output.field_values()["text"], "hello");

        let audit = store
            .audit_log(&doc.tenant_id, &AuditQuery::default())
            .await
            .unwrap();
        let completed = audit
            .iter()
            .filter(|e| e.action == AuditAction::TaskCompleted)
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn pending_mark_does_not_rewind_a_completed_job() {
        let store = InMemoryStore::new();
        let doc = document("t1", "d1");
        store.insert_document(&doc).await.unwrap();
        store.commit_task(&ocr_commit(&doc, "j1", "done")).await.unwrap();

        let skipped = store
            .mark_task_pending(
                &doc.tenant_id,
                &doc.id,
                TaskType::Ocr,
                &JobId::from("j1"),
                &[TaskState::Pending],
                None,
            )
            .await
            .unwrap();
        assert_eq!(skipped, None);
        let statuses = store.task_statuses(&doc.tenant_id, &doc.id).await.unwrap();
        assert_eq!(statuses[0].state, TaskState::Completed);

        let applied = store
            .mark_task_pending(
                &doc.tenant_id,
                &doc.id,
                TaskType::Ocr,
                &JobId::from("j2"),
                &[TaskState::Pending],
                None,
            )
            .await
            .unwrap();
        assert_eq!(applied, Some(DocumentStatus::Processing));
        let statuses = store.task_statuses(&doc.tenant_id, &doc.id).await.unwrap();
        assert_eq!(statuses[0].state, TaskState::Pending);
        assert_eq!(statuses[0].job_id.as_ref().map(|j| j.as_str()), Some("j2"));
    }

    #[tokio::test]
    async fn superseding_commit_keeps_the_replaced_output_in_audit() {
        let store = InMemoryStore::new();
        let doc = document("t1", "d1");
        store.insert_document(&doc).await.unwrap();
        store.commit_task(&ocr_commit(&doc, "j1", "first read")).await.unwrap();
        let outcome = store
            .commit_task(&ocr_commit(&doc, "j2", "second read"))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Superseded);

        let audit = store
            .audit_log(&doc.tenant_id, &AuditQuery::default())
            .await
            .unwrap();
        let completed: Vec<_> = audit
            .iter()
            .filter(|e| e.action == AuditAction::TaskCompleted)
            .collect();
        assert_eq!(completed.len(), 2);
        let superseding = completed
            .iter()
            .find(|e| e.details["outcome"] == "superseded")
            .unwrap();
        assert_eq!(superseding.details["superseded"]["job_id"], "j1");
        assert_eq!(
            superseding.details["superseded"]["output"]["text"],
            "first read"
        );
        let inserted = completed
            .iter()
            .find(|e| e.details["outcome"] == "inserted")
            .unwrap();
        assert!(inserted.details.get("superseded").is_none());
    }

    #[tokio::test]
    async fn reviewed_result_is_frozen_against_new_jobs() {
        let store = InMemoryStore::new();
        let doc = document("t1", "d1");
        store.insert_document(&doc).await.unwrap();
        store.commit_task(&ocr_commit(&doc, "j1", "v1")).await.unwrap();
        store
            .apply_review(
                &doc.tenant_id,
                &doc.id,
                TaskType::Ocr,
                &ReviewAction::MarkReviewed { note: None },
                &UserId::from("u1"),
            )
            .await
            .unwrap();
        let outcome = store.commit_task(&ocr_commit(&doc, "j2", "v2")).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Frozen);
    }

    #[tokio::test]
    async fn reads_are_tenant_scoped() {
        let store = InMemoryStore::new();
        let doc = document("t1", "d1");
        store.insert_document(&doc).await.unwrap();
        assert!(store
            .get_document(&TenantId::from("t2"), &doc.id)
            .await
            .unwrap()
            .is_none());
        let err = store
            .get_document(&TenantId::from(""), &doc.id)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        let err = store
            .set_task_state(
                &TenantId::from("t2"),
                &doc.id,
                TaskType::Ocr,
                TaskState::Processing,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn replace_chunks_bumps_generation_unless_identical() {
        let store = InMemoryStore::new();
        let doc = document("t1", "d1");
        store.insert_document(&doc).await.unwrap();
        let v1 = vec![chunk(&doc, 0, "a", vec![1.0, 0.0]), chunk(&doc, 1, "b", vec![0.0, 1.0])];
        assert_eq!(store.replace_chunks(&doc.tenant_id, &doc.id, &v1).await.unwrap(), 1);
        assert_eq!(store.replace_chunks(&doc.tenant_id, &doc.id, &v1).await.unwrap(), 1);
        let v2 = vec![chunk(&doc, 0, "c", vec![1.0, 1.0])];
        assert_eq!(store.replace_chunks(&doc.tenant_id, &doc.id, &v2).await.unwrap(), 2);
        let stored = store.chunks_for_document(&doc.tenant_id, &doc.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].generation, 2);
    }
}
