//! SQLite-backed [`Store`] implementation.
//!
//! Every read puts the tenant into the `WHERE` clause of the query itself,
//! and every multi-row write runs in one transaction (`pool.begin()` +
//! `&mut *tx`). Vectors are little-endian f32 BLOBs; similarity search is
//! brute-force cosine over the tenant's chunks of the query's embedding
//! version.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use docflow_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, EmbeddingVersion};
use docflow_core::models::{
    AuditAction, AuditEntry, AuditQuery, BlobLocator, Document, DocumentChunk, DocumentId,
    DocumentStatus, JobId, NewAuditEntry, ScoredChunk, TaskState, TaskStatus, TaskType, TenantId,
    UserId,
};
use docflow_core::results::{
    completion_details, Correction, ReviewState, StoredResult, TaskCommit, UpsertOutcome,
};
use docflow_core::review::{check_action, ReviewAction};
use docflow_core::store::{audit_dedup_key, rank_scored, Store, VectorQuery};
use docflow_core::{PipelineError, Result};

use crate::db::{col, from_millis, millis, store_error};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ============ Row decoding ============

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let status: String = col(row, "status")?;
    let locator: String = col(row, "storage_locator")?;
    Ok(Document {
        id: DocumentId::new(col::<String>(row, "id")?),
        tenant_id: TenantId::new(col::<String>(row, "tenant_id")?),
        user_id: UserId::new(col::<String>(row, "user_id")?),
        filename: col(row, "filename")?,
        mime_type: col(row, "mime_type")?,
        storage_locator: BlobLocator::parse(&locator)?,
        size_bytes: col(row, "size_bytes")?,
        content_sha256: col(row, "content_sha256")?,
        status: status.parse()?,
        created_at: from_millis(col(row, "created_at")?),
        updated_at: from_millis(col(row, "updated_at")?),
        deleted_at: col::<Option<i64>>(row, "deleted_at")?.map(from_millis),
    })
}

fn result_from_row(row: &SqliteRow) -> Result<StoredResult> {
    let task_type: String = col(row, "task_type")?;
    let output: String = col(row, "output_json")?;
    let review_state: String = col(row, "review_state")?;
    Ok(StoredResult {
        tenant_id: TenantId::new(col::<String>(row, "tenant_id")?),
        document_id: DocumentId::new(col::<String>(row, "document_id")?),
        task_type: task_type.parse()?,
        job_id: JobId::new(col::<String>(row, "job_id")?),
        output: serde_json::from_str(&output)?,
        confidence: col::<Option<f64>>(row, "confidence")?.map(|c| c as f32),
        model_used: col(row, "model_used")?,
        review_state: ReviewState::parse(&review_state)?,
        created_at: from_millis(col(row, "created_at")?),
        updated_at: from_millis(col(row, "updated_at")?),
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<DocumentChunk> {
    let embedding: Vec<u8> = col(row, "embedding")?;
    let metadata: String = col(row, "metadata_json")?;
    let token_count: i64 = col(row, "token_count")?;
    let dims: i64 = col(row, "embedding_dims")?;
    Ok(DocumentChunk {
        chunk_id: col(row, "chunk_id")?,
        tenant_id: TenantId::new(col::<String>(row, "tenant_id")?),
        document_id: DocumentId::new(col::<String>(row, "document_id")?),
        chunk_index: col(row, "chunk_index")?,
        text: col(row, "text")?,
        hash: col(row, "hash")?,
        token_count: token_count.max(0) as usize,
        embedding: blob_to_vec(&embedding),
        embedding_version: EmbeddingVersion::new(
            col::<String>(row, "embedding_model")?,
            dims.max(0) as usize,
        ),
        generation: col(row, "generation")?,
        metadata: serde_json::from_str(&metadata)?,
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<AuditEntry> {
    let action: String = col(row, "action")?;
    let details: String = col(row, "details_json")?;
    let task_type = col::<Option<String>>(row, "task_type")?
        .map(|t| t.parse::<TaskType>())
        .transpose()?;
    Ok(AuditEntry {
        id: col(row, "id")?,
        tenant_id: TenantId::new(col::<String>(row, "tenant_id")?),
        user_id: col::<Option<String>>(row, "user_id")?.map(UserId::new),
        document_id: col::<Option<String>>(row, "document_id")?.map(DocumentId::new),
        job_id: col::<Option<String>>(row, "job_id")?.map(JobId::new),
        task_type,
        action: action.parse::<AuditAction>()?,
        details: serde_json::from_str(&details)?,
        created_at: from_millis(col(row, "created_at")?),
    })
}

// ============ Transaction-scoped helpers ============

/// Fails with `IsolationViolation` when the document exists under another
/// tenant, `NotFound` when it does not exist at all.
async fn owned_document(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    id: &DocumentId,
) -> Result<()> {
    let owner: Option<String> = sqlx::query_scalar("SELECT tenant_id FROM documents WHERE id = ?")
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(store_error)?;
    match owner {
        Some(t) if t == tenant.as_str() => Ok(()),
        Some(_) => Err(PipelineError::IsolationViolation(format!(
            "document {} does not belong to tenant {}",
            id, tenant
        ))),
        None => Err(PipelineError::not_found("document", id)),
    }
}

async fn insert_audit(conn: &mut SqliteConnection, entry: &NewAuditEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_log
            (tenant_id, user_id, document_id, job_id, task_type, action, details_json, dedup_key, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(dedup_key) DO NOTHING
        "#,
    )
    .bind(entry.tenant_id.as_str())
    .bind(entry.user_id.as_ref().map(|u| u.as_str()))
    .bind(entry.document_id.as_ref().map(|d| d.as_str()))
    .bind(entry.job_id.as_ref().map(|j| j.as_str()))
    .bind(entry.task_type.map(|t| t.as_str()))
    .bind(entry.action.as_str())
    .bind(entry.details.to_string())
    .bind(audit_dedup_key(entry))
    .bind(millis(Utc::now()))
    .execute(&mut *conn)
    .await
    .map_err(store_error)?;
    Ok(())
}

async fn upsert_task_state(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    document: &DocumentId,
    task_type: TaskType,
    state: TaskState,
    job_id: Option<&JobId>,
    error: Option<&str>,
) -> Result<DocumentStatus> {
    owned_document(&mut *conn, tenant, document).await?;
    let now = millis(Utc::now());
    sqlx::query(
        r#"
        INSERT INTO task_status (tenant_id, document_id, task_type, state, job_id, error, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(document_id, task_type) DO UPDATE SET
            state = excluded.state,
            job_id = COALESCE(excluded.job_id, task_status.job_id),
            error = excluded.error,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(tenant.as_str())
    .bind(document.as_str())
    .bind(task_type.as_str())
    .bind(state.as_str())
    .bind(job_id.map(|j| j.as_str()))
    .bind(error)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(store_error)?;
    roll_up_document(conn, tenant, document, now).await
}

/// Recompute the document status from its task rows and store it.
async fn roll_up_document(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    document: &DocumentId,
    now: i64,
) -> Result<DocumentStatus> {
    let states: Vec<String> =
        sqlx::query_scalar("SELECT state FROM task_status WHERE tenant_id = ? AND document_id = ?")
            .bind(tenant.as_str())
            .bind(document.as_str())
            .fetch_all(&mut *conn)
            .await
            .map_err(store_error)?;
    let states = states
        .iter()
        .map(|s| s.parse::<TaskState>())
        .collect::<Result<Vec<_>>>()?;
    let status = DocumentStatus::roll_up(states);

    sqlx::query("UPDATE documents SET status = ?, updated_at = ? WHERE tenant_id = ? AND id = ?")
        .bind(status.as_str())
        .bind(now)
        .bind(tenant.as_str())
        .bind(document.as_str())
        .execute(&mut *conn)
        .await
        .map_err(store_error)?;
    Ok(status)
}

async fn fetch_result(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    document: &DocumentId,
    task_type: TaskType,
) -> Result<Option<StoredResult>> {
    let row = sqlx::query(
        "SELECT * FROM task_results WHERE tenant_id = ? AND document_id = ? AND task_type = ?",
    )
    .bind(tenant.as_str())
    .bind(document.as_str())
    .bind(task_type.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(store_error)?;
    row.as_ref().map(result_from_row).transpose()
}

fn push_document_scope(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[DocumentId]) {
    qb.push(" AND document_id IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id.as_str().to_string());
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        doc.tenant_id.require()?;
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE id = ?")
            .bind(doc.id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_error)?;
        if exists.is_some() {
            return Err(PipelineError::MalformedInput(format!(
                "document {} already exists",
                doc.id
            )));
        }
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, tenant_id, user_id, filename, mime_type, storage_locator, size_bytes,
                 content_sha256, status, created_at, updated_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(doc.id.as_str())
        .bind(doc.tenant_id.as_str())
        .bind(doc.user_id.as_str())
        .bind(&doc.filename)
        .bind(&doc.mime_type)
        .bind(doc.storage_locator.as_str())
        .bind(doc.size_bytes)
        .bind(&doc.content_sha256)
        .bind(doc.status.as_str())
        .bind(millis(doc.created_at))
        .bind(millis(doc.updated_at))
        .bind(doc.deleted_at.map(millis))
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;
        Ok(())
    }

    async fn get_document(&self, tenant: &TenantId, id: &DocumentId) -> Result<Option<Document>> {
        tenant.require()?;
        let row = sqlx::query("SELECT * FROM documents WHERE tenant_id = ? AND id = ?")
            .bind(tenant.as_str())
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_documents(&self, tenant: &TenantId, limit: usize) -> Result<Vec<Document>> {
        tenant.require()?;
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE tenant_id = ? ORDER BY created_at DESC, id LIMIT ?",
        )
        .bind(tenant.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter().map(document_from_row).collect()
    }

    async fn mark_document_deleted(
        &self,
        tenant: &TenantId,
        id: &DocumentId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        tenant.require()?;
        let result = sqlx::query(
            "UPDATE documents SET deleted_at = ?, updated_at = ? WHERE tenant_id = ? AND id = ? AND deleted_at IS NULL",
        )
        .bind(millis(at))
        .bind(millis(at))
        .bind(tenant.as_str())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn task_statuses(&self, tenant: &TenantId, id: &DocumentId) -> Result<Vec<TaskStatus>> {
        tenant.require()?;
        let rows = sqlx::query("SELECT * FROM task_status WHERE tenant_id = ? AND document_id = ?")
            .bind(tenant.as_str())
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        let mut statuses = rows
            .iter()
            .map(|row| {
                let task_type: String = col(row, "task_type")?;
                let state: String = col(row, "state")?;
                Ok(TaskStatus {
                    task_type: task_type.parse()?,
                    state: state.parse()?,
                    job_id: col::<Option<String>>(row, "job_id")?.map(JobId::new),
                    error: col(row, "error")?,
                    updated_at: from_millis(col(row, "updated_at")?),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        statuses.sort_by_key(|s| s.task_type);
        Ok(statuses)
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
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let status =
            upsert_task_state(&mut tx, tenant, document, task_type, state, job_id, error).await?;
        tx.commit().await.map_err(store_error)?;
        Ok(status)
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
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        owned_document(&mut tx, tenant, document).await?;
        let now = millis(Utc::now());

        // Check and write in one statement.
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO task_status \
             (tenant_id, document_id, task_type, state, job_id, error, updated_at) VALUES (",
        );
        {
            let mut values = qb.separated(", ");
            values.push_bind(tenant.as_str().to_string());
            values.push_bind(document.as_str().to_string());
            values.push_bind(task_type.as_str().to_string());
            values.push_bind(TaskState::Pending.as_str().to_string());
            values.push_bind(job_id.as_str().to_string());
            values.push_bind(error.map(str::to_string));
            values.push_bind(now);
        }
        qb.push(
            ") ON CONFLICT(document_id, task_type) DO UPDATE SET \
             state = excluded.state, job_id = excluded.job_id, \
             error = excluded.error, updated_at = excluded.updated_at \
             WHERE task_status.job_id IS NOT excluded.job_id",
        );
        for state in from {
            qb.push(" OR task_status.state = ")
                .push_bind(state.as_str().to_string());
        }
        let applied = qb
            .build()
            .execute(&mut *tx)
            .await
            .map_err(store_error)?
            .rows_affected()
            > 0;
        if !applied {
            tracing::debug!(job_id = %job_id, task_type = %task_type, "task already moved past pending");
            return Ok(None);
        }
        let status = roll_up_document(&mut tx, tenant, document, now).await?;
        tx.commit().await.map_err(store_error)?;
        Ok(Some(status))
    }

    async fn commit_task(&self, commit: &TaskCommit) -> Result<UpsertOutcome> {
        let tenant = &commit.tenant_id;
        tenant.require()?;
        let task_type = commit.task_type();
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        owned_document(&mut tx, tenant, &commit.document_id).await?;

        let existing = fetch_result(&mut tx, tenant, &commit.document_id, task_type).await?;
        let outcome = match &existing {
            Some(row) if row.job_id == commit.job_id => UpsertOutcome::Unchanged,
            Some(row) if row.review_state != ReviewState::Extracted => UpsertOutcome::Frozen,
            Some(_) => UpsertOutcome::Superseded,
            None => UpsertOutcome::Inserted,
        };

        if matches!(outcome, UpsertOutcome::Inserted | UpsertOutcome::Superseded) {
            let now = millis(Utc::now());
            sqlx::query(
                r#"
                INSERT INTO task_results
                    (tenant_id, document_id, task_type, job_id, output_json, confidence,
                     model_used, review_state, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(document_id, task_type) DO UPDATE SET
                    job_id = excluded.job_id,
                    output_json = excluded.output_json,
                    confidence = excluded.confidence,
                    model_used = excluded.model_used,
                    review_state = excluded.review_state,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(tenant.as_str())
            .bind(commit.document_id.as_str())
            .bind(task_type.as_str())
            .bind(commit.job_id.as_str())
            .bind(serde_json::to_string(&commit.output)?)
            .bind(commit.output.confidence().map(f64::from))
            .bind(commit.output.model_used())
            .bind(ReviewState::Extracted.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        }

        upsert_task_state(
            &mut tx,
            tenant,
            &commit.document_id,
            task_type,
            TaskState::Completed,
            Some(&commit.job_id),
            None,
        )
        .await?;
        insert_audit(
            &mut tx,
            &NewAuditEntry::new(tenant, AuditAction::TaskCompleted)
                .document(&commit.document_id)
                .job(&commit.job_id, task_type)
                .details(completion_details(outcome, existing.as_ref())),
        )
        .await?;
        tx.commit().await.map_err(store_error)?;
        Ok(outcome)
    }

    async fn get_result(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
    ) -> Result<Option<StoredResult>> {
        tenant.require()?;
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        fetch_result(&mut conn, tenant, document, task_type).await
    }

    async fn corrections(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
    ) -> Result<Vec<Correction>> {
        tenant.require()?;
        let rows = sqlx::query(
            r#"
            SELECT id, field, value_json, corrected_by, note, created_at
            FROM result_corrections
            WHERE tenant_id = ? AND document_id = ? AND task_type = ?
            ORDER BY id
            "#,
        )
        .bind(tenant.as_str())
        .bind(document.as_str())
        .bind(task_type.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter()
            .map(|row| {
                let value: String = col(row, "value_json")?;
                Ok(Correction {
                    id: col(row, "id")?,
                    field: col(row, "field")?,
                    value: serde_json::from_str(&value)?,
                    corrected_by: UserId::new(col::<String>(row, "corrected_by")?),
                    note: col(row, "note")?,
                    created_at: from_millis(col(row, "created_at")?),
                })
            })
            .collect()
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
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let current = fetch_result(&mut tx, tenant, document, task_type)
            .await?
            .ok_or_else(|| {
                PipelineError::not_found("result", format!("{}/{}", document, task_type))
            })?;
        let next = check_action(&current, action)?;
        let now = millis(Utc::now());

        if let ReviewAction::Correct { field, value, note } = action {
            sqlx::query(
                r#"
                INSERT INTO result_corrections
                    (tenant_id, document_id, task_type, field, value_json, corrected_by, note, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(tenant.as_str())
            .bind(document.as_str())
            .bind(task_type.as_str())
            .bind(field)
            .bind(value.to_string())
            .bind(actor.as_str())
            .bind(note.as_deref())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        }

        sqlx::query(
            "UPDATE task_results SET review_state = ?, updated_at = ? WHERE tenant_id = ? AND document_id = ? AND task_type = ?",
        )
        .bind(next.as_str())
        .bind(now)
        .bind(tenant.as_str())
        .bind(document.as_str())
        .bind(task_type.as_str())
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        insert_audit(
            &mut tx,
            &NewAuditEntry::new(tenant, action.audit_action())
                .document(document)
                .task(task_type)
                .user(actor)
                .details(action.audit_details(current.review_state, next)),
        )
        .await?;

        let updated = fetch_result(&mut tx, tenant, document, task_type)
            .await?
            .ok_or_else(|| PipelineError::not_found("result", document))?;
        tx.commit().await.map_err(store_error)?;
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
        let mut ordered: Vec<&DocumentChunk> = chunks.iter().collect();
        ordered.sort_by_key(|c| c.chunk_index);

        let mut tx = self.pool.begin().await.map_err(store_error)?;
        owned_document(&mut tx, tenant, document).await?;

        let current: Option<i64> = sqlx::query_scalar(
            "SELECT generation FROM chunk_sets WHERE tenant_id = ? AND document_id = ?",
        )
        .bind(tenant.as_str())
        .bind(document.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;

        if let Some(generation) = current {
            let existing: Vec<(String, i64)> = sqlx::query_as(
                "SELECT chunk_id, chunk_index FROM chunks WHERE tenant_id = ? AND document_id = ? ORDER BY chunk_index",
            )
            .bind(tenant.as_str())
            .bind(document.as_str())
            .fetch_all(&mut *tx)
            .await
            .map_err(store_error)?;
            let same = existing.len() == ordered.len()
                && existing
                    .iter()
                    .zip(&ordered)
                    .all(|((id, idx), c)| id == &c.chunk_id && *idx == c.chunk_index);
            if same {
                return Ok(generation);
            }
        }
        let generation = current.unwrap_or(0) + 1;

        // Readers see either the old set or the new one, never a mix.
        sqlx::query("DELETE FROM chunks WHERE tenant_id = ? AND document_id = ?")
            .bind(tenant.as_str())
            .bind(document.as_str())
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

        for c in &ordered {
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (chunk_id, tenant_id, document_id, chunk_index, text, hash, token_count,
                     embedding, embedding_model, embedding_dims, generation, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&c.chunk_id)
            .bind(tenant.as_str())
            .bind(document.as_str())
            .bind(c.chunk_index)
            .bind(&c.text)
            .bind(&c.hash)
            .bind(c.token_count as i64)
            .bind(vec_to_blob(&c.embedding))
            .bind(&c.embedding_version.model)
            .bind(c.embedding_version.dims as i64)
            .bind(generation)
            .bind(c.metadata.to_string())
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        }

        sqlx::query(
            r#"
            INSERT INTO chunk_sets (document_id, tenant_id, generation, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                generation = excluded.generation,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(document.as_str())
        .bind(tenant.as_str())
        .bind(generation)
        .bind(millis(Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        tx.commit().await.map_err(store_error)?;
        Ok(generation)
    }

    async fn chunks_for_document(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
    ) -> Result<Vec<DocumentChunk>> {
        tenant.require()?;
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE tenant_id = ? AND document_id = ? ORDER BY chunk_index",
        )
        .bind(tenant.as_str())
        .bind(document.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn embedding_versions(
        &self,
        tenant: &TenantId,
        document_ids: Option<&[DocumentId]>,
    ) -> Result<Vec<EmbeddingVersion>> {
        tenant.require()?;
        if document_ids.is_some_and(|ids| ids.is_empty()) {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT DISTINCT embedding_model, embedding_dims FROM chunks WHERE tenant_id = ",
        );
        qb.push_bind(tenant.as_str().to_string());
        if let Some(ids) = document_ids {
            push_document_scope(&mut qb, ids);
        }
        let rows: Vec<(String, i64)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(rows
            .into_iter()
            .map(|(model, dims)| EmbeddingVersion::new(model, dims.max(0) as usize))
            .collect())
    }

    async fn vector_search(&self, query: &VectorQuery<'_>) -> Result<Vec<ScoredChunk>> {
        query.tenant_id.require()?;
        if query.document_ids.is_some_and(|ids| ids.is_empty()) {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT chunk_id, tenant_id, document_id, chunk_index, text, embedding FROM chunks WHERE tenant_id = ",
        );
        qb.push_bind(query.tenant_id.as_str().to_string());
        qb.push(" AND embedding_model = ");
        qb.push_bind(query.version.model.clone());
        qb.push(" AND embedding_dims = ");
        qb.push_bind(query.version.dims as i64);
        if let Some(ids) = query.document_ids {
            push_document_scope(&mut qb, ids);
        }
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        let mut scored = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = col(row, "embedding")?;
                Ok(ScoredChunk {
                    chunk_id: col(row, "chunk_id")?,
                    tenant_id: TenantId::new(col::<String>(row, "tenant_id")?),
                    document_id: DocumentId::new(col::<String>(row, "document_id")?),
                    chunk_index: col(row, "chunk_index")?,
                    text: col(row, "text")?,
                    score: cosine_similarity(query.vector, &blob_to_vec(&blob)),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        scored.sort_by(rank_scored);
        scored.truncate(query.limit);
        Ok(scored)
    }

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<()> {
        entry.tenant_id.require()?;
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        insert_audit(&mut conn, entry).await
    }

    async fn audit_log(&self, tenant: &TenantId, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        tenant.require()?;
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM audit_log WHERE tenant_id = ");
        qb.push_bind(tenant.as_str().to_string());
        if let Some(from) = query.from {
            qb.push(" AND created_at >= ");
            qb.push_bind(millis(from));
        }
        if let Some(to) = query.to {
            qb.push(" AND created_at <= ");
            qb.push_bind(millis(to));
        }
        if let Some(document) = &query.document_id {
            qb.push(" AND document_id = ");
            qb.push_bind(document.as_str().to_string());
        }
        qb.push(" ORDER BY id LIMIT ");
        qb.push_bind(query.limit.unwrap_or(100) as i64);
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        rows.iter().map(audit_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::{db, migrate};
    use docflow_core::results::{OcrOutput, TaskOutput};
    use docflow_core::testing::{chunk, document};

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_config(&format!(
            "[db]\npath = \"{}\"\n",
            dir.path().join("store.sqlite").display()
        ))
        .unwrap();
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        (dir, SqliteStore::new(pool))
    }

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
        let (_dir, store) = store().await;
        let doc = document("t1", "d1");
        store.insert_document(&doc).await.unwrap();

        assert_eq!(
            store.commit_task(&ocr_commit(&doc, "j1", "hello")).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.commit_task(&ocr_commit(&doc, "j1", "other")).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(
            store.commit_task(&ocr_commit(&doc, "j2", "newer")).await.unwrap(),
            UpsertOutcome::Superseded
        );

        let row = store
            .get_result(&doc.tenant_id, &doc.id, TaskType::Ocr)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.output.field_values()["text"], "newer");
        assert_eq!(row.job_id.as_str(), "j2");

        let completed: Vec<_> = store
            .audit_log(&doc.tenant_id, &AuditQuery::default())
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.action == AuditAction::TaskCompleted)
            .collect();
        assert_eq!(completed.len(), 2);
        let superseding = completed
            .iter()
            .find(|e| e.details["outcome"] == "superseded")
            .unwrap();
        assert_eq!(superseding.details["superseded"]["job_id"], "j1");
        assert_eq!(superseding.details["superseded"]["output"]["text"], "hello");
        let doc = store.get_document(&doc.tenant_id, &doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
    }

    async fn mark(
        store: &SqliteStore,
        doc: &Document,
        job: &str,
        from: &[TaskState],
    ) -> Option<DocumentStatus> {
        store
            .mark_task_pending(&doc.tenant_id, &doc.id, TaskType::Ocr, &JobId::from(job), from, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pending_mark_skips_jobs_that_moved_on() {
        let (_dir, store) = store().await;
        let doc = document("t1", "d1");
        store.insert_document(&doc).await.unwrap();
        store.commit_task(&ocr_commit(&doc, "j1", "done")).await.unwrap();

        assert_eq!(mark(&store, &doc, "j1", &[TaskState::Pending]).await, None);
        let statuses = store.task_statuses(&doc.tenant_id, &doc.id).await.unwrap();
        assert_eq!(statuses[0].state, TaskState::Completed);
        let stored = store.get_document(&doc.tenant_id, &doc.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Completed);

        // A requeue may rewind its own processing row.
        store
            .set_task_state(
                &doc.tenant_id,
                &doc.id,
                TaskType::Ocr,
                TaskState::Processing,
                Some(&JobId::from("j2")),
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            mark(&store, &doc, "j2", &[TaskState::Processing, TaskState::Pending]).await,
            Some(DocumentStatus::Processing)
        );
        let statuses = store.task_statuses(&doc.tenant_id, &doc.id).await.unwrap();
        assert_eq!(statuses[0].state, TaskState::Pending);
        assert_eq!(statuses[0].job_id.as_ref().map(|j| j.as_str()), Some("j2"));
    }

    #[tokio::test]
    async fn foreign_tenant_write_is_an_isolation_violation() {
        let (_dir, store) = store().await;
        let doc = document("t1", "d1");
        store.insert_document(&doc).await.unwrap();
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
        assert!(store
            .get_document(&TenantId::from("t2"), &doc.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn review_appends_corrections_and_freezes_output() {
        let (_dir, store) = store().await;
        let doc = document("t1", "d1");
        store.insert_document(&doc).await.unwrap();
        store.commit_task(&ocr_commit(&doc, "j1", "helo")).await.unwrap();
        let reviewed = store
            .apply_review(
                &doc.tenant_id,
                &doc.id,
                TaskType::Ocr,
                &ReviewAction::Correct {
                    field: "text".into(),
                    value: "hello".into(),
                    note: Some("typo".into()),
                },
                &UserId::from("u1"),
            )
            .await
            .unwrap();
        assert_eq!(reviewed.review_state, ReviewState::Reviewed);
        let corrections = store
            .corrections(&doc.tenant_id, &doc.id, TaskType::Ocr)
            .await
            .unwrap();
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].value, "hello");
        assert_eq!(
            store.commit_task(&ocr_commit(&doc, "j2", "x")).await.unwrap(),
            UpsertOutcome::Frozen
        );
    }

    #[tokio::test]
    async fn chunk_replacement_and_search_are_tenant_scoped() {
        let (_dir, store) = store().await;
        let mine = document("t1", "d1");
        let theirs = document("t2", "d2");
        store.insert_document(&mine).await.unwrap();
        store.insert_document(&theirs).await.unwrap();

        let v1 = vec![
            chunk(&mine, 0, "alpha", vec![1.0, 0.0]),
            chunk(&mine, 1, "beta", vec![0.0, 1.0]),
        ];
        assert_eq!(store.replace_chunks(&mine.tenant_id, &mine.id, &v1).await.unwrap(), 1);
        assert_eq!(store.replace_chunks(&mine.tenant_id, &mine.id, &v1).await.unwrap(), 1);
        store
            .replace_chunks(
                &theirs.tenant_id,
                &theirs.id,
                &[chunk(&theirs, 0, "alpha", vec![1.0, 0.0])],
            )
            .await
            .unwrap();

        let version = v1[0].embedding_version.clone();
        let hits = store
            .vector_search(&VectorQuery {
                tenant_id: &mine.tenant_id,
                vector: &[1.0, 0.0],
                version: &version,
                document_ids: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.tenant_id == mine.tenant_id));
        assert_eq!(hits[0].text, "alpha");

        let err = store
            .replace_chunks(&mine.tenant_id, &mine.id, &[chunk(&theirs, 0, "x", vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(err.is_fatal());

        let v2 = vec![chunk(&mine, 0, "gamma", vec![1.0, 1.0])];
        assert_eq!(store.replace_chunks(&mine.tenant_id, &mine.id, &v2).await.unwrap(), 2);
        let stored = store.chunks_for_document(&mine.tenant_id, &mine.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].generation, 2);
        assert_eq!(stored[0].embedding, vec![1.0, 1.0]);
    }

    #[tokio::test]
    async fn once_per_job_audit_entries_are_deduplicated() {
        let (_dir, store) = store().await;
        let doc = document("t1", "d1");
        store.insert_document(&doc).await.unwrap();
        let entry = NewAuditEntry::new(&doc.tenant_id, AuditAction::JobEnqueued)
            .document(&doc.id)
            .job(&JobId::from("j1"), TaskType::Ocr);
        store.append_audit(&entry).await.unwrap();
        store.append_audit(&entry).await.unwrap();
        let retried = NewAuditEntry::new(&doc.tenant_id, AuditAction::TaskRetried)
            .job(&JobId::from("j1"), TaskType::Ocr);
        store.append_audit(&retried).await.unwrap();
        store.append_audit(&retried).await.unwrap();
        let log = store
            .audit_log(&doc.tenant_id, &AuditQuery::default())
            .await
            .unwrap();
        assert_eq!(log.len(), 3);
        assert!(store
            .audit_log(&TenantId::from("t2"), &AuditQuery::default())
            .await
            .unwrap()
            .is_empty());
    }
}
