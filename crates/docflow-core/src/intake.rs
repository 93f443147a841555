//! Front door: document upload and soft delete.
//!
//! Upload writes the blob first and records the document second, so a
//! document row always points at a durable blob. Delete marks the row and
//! removes the blob; stage jobs already queued for the document find it
//! gone and ack without work.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::blob::content_hash;
use crate::error::{PipelineError, Result};
use crate::models::{
    AuditAction, BlobLocator, Document, DocumentId, DocumentStatus, NewAuditEntry, TaskStatus,
    TenantId, UserId,
};
use crate::pipeline::Pipeline;

#[derive(Debug, Clone)]
pub struct Upload {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// A document with its per-task statuses.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    #[serde(flatten)]
    pub document: Document,
    pub tasks: Vec<TaskStatus>,
}

pub struct Intake {
    pipeline: Pipeline,
}

impl Intake {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub async fn upload(&self, upload: Upload) -> Result<Document> {
        upload.tenant_id.require()?;
        if upload.filename.trim().is_empty() {
            return Err(PipelineError::MalformedInput(
                "filename must not be empty".to_string(),
            ));
        }
        if upload.mime_type.trim().is_empty() {
            return Err(PipelineError::MalformedInput(
                "mime type must not be empty".to_string(),
            ));
        }

        let id = DocumentId::generate();
        let locator = BlobLocator::for_upload(&upload.tenant_id, &id, &upload.filename)?;
        self.pipeline.blobs.put(&locator, &upload.bytes).await?;

        let now = Utc::now();
        let doc = Document {
            id,
            tenant_id: upload.tenant_id,
            user_id: upload.user_id,
            filename: upload.filename,
            mime_type: upload.mime_type,
            storage_locator: locator,
            size_bytes: upload.bytes.len() as i64,
            content_sha256: content_hash(&upload.bytes),
            status: DocumentStatus::Uploaded,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        if let Err(e) = self.pipeline.store.insert_document(&doc).await {
            if let Err(cleanup) = self.pipeline.blobs.delete(&doc.storage_locator).await {
                tracing::warn!(locator = %doc.storage_locator, error = %cleanup, "orphaned blob");
            }
            return Err(e);
        }

        self.pipeline
            .store
            .append_audit(
                &NewAuditEntry::new(&doc.tenant_id, AuditAction::DocumentUploaded)
                    .document(&doc.id)
                    .user(&doc.user_id)
                    .details(json!({
                        "filename": doc.filename,
                        "mime_type": doc.mime_type,
                        "size_bytes": doc.size_bytes,
                        "sha256": doc.content_sha256,
                    })),
            )
            .await?;
        tracing::info!(
            tenant = %doc.tenant_id,
            document_id = %doc.id,
            size_bytes = doc.size_bytes,
            "document uploaded"
        );
        Ok(doc)
    }

    pub async fn describe(&self, tenant: &TenantId, id: &DocumentId) -> Result<DocumentView> {
        let store = &self.pipeline.store;
        let document = store
            .get_document(tenant, id)
            .await?
            .ok_or_else(|| PipelineError::not_found("document", id))?;
        let tasks = store.task_statuses(tenant, id).await?;
        Ok(DocumentView { document, tasks })
    }

    /// Soft-delete a document and remove its blob. Deleting twice is not an
    /// error; the second call returns the already-deleted row.
    pub async fn delete(
        &self,
        tenant: &TenantId,
        id: &DocumentId,
        actor: &UserId,
    ) -> Result<Document> {
        let store = &self.pipeline.store;
        let doc = store
            .get_document(tenant, id)
            .await?
            .ok_or_else(|| PipelineError::not_found("document", id))?;
        if doc.is_deleted() {
            return Ok(doc);
        }
        let now = Utc::now();
        if store.mark_document_deleted(tenant, id, now).await? {
            self.pipeline.blobs.delete(&doc.storage_locator).await?;
            store
                .append_audit(
                    &NewAuditEntry::new(tenant, AuditAction::DocumentDeleted)
                        .document(id)
                        .user(actor),
                )
                .await?;
            tracing::info!(tenant = %tenant, document_id = %id, "document deleted");
        }
        store
            .get_document(tenant, id)
            .await?
            .ok_or_else(|| PipelineError::not_found("document", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPipeline;

    #[tokio::test]
    async fn upload_stores_blob_before_document() {
        let t = TestPipeline::new();
        let doc = t.upload("t1", "Q3 report.txt", b"quarterly numbers").await;
        assert_eq!(doc.status, DocumentStatus::Uploaded);
        assert!(doc
            .storage_locator
            .as_str()
            .starts_with(&format!("tenants/t1/documents/{}/", doc.id)));
        let bytes = t.pipeline.blobs.get(&doc.storage_locator).await.unwrap();
        assert_eq!(bytes.unwrap(), b"quarterly numbers");
        assert_eq!(doc.content_sha256, content_hash(b"quarterly numbers"));
    }

    #[tokio::test]
    async fn delete_removes_blob_and_is_repeatable() {
        let t = TestPipeline::new();
        let doc = t.upload("t1", "a.txt", b"x").await;
        let intake = t.pipeline.intake();
        let user = UserId::from("admin");
        let deleted = intake.delete(&doc.tenant_id, &doc.id, &user).await.unwrap();
        assert!(deleted.is_deleted());
        assert!(t.pipeline.blobs.get(&doc.storage_locator).await.unwrap().is_none());
        assert!(intake.delete(&doc.tenant_id, &doc.id, &user).await.is_ok());
        assert!(intake
            .delete(&TenantId::from("t2"), &doc.id, &user)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn blank_tenant_upload_is_rejected() {
        let t = TestPipeline::new();
        let err = t
            .pipeline
            .intake()
            .upload(Upload {
                tenant_id: TenantId::from(""),
                user_id: UserId::from("u"),
                filename: "a.txt".into(),
                mime_type: "text/plain".into(),
                bytes: vec![],
            })
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
