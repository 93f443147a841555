//! Job dispatcher: turns "run task X on document D" into a queued job.
//!
//! Enqueue never calls a primitive. It checks that the document exists for
//! the tenant (so its blob was stored first), hands the job to the queue,
//! and only then marks the task `pending`. A queue outage therefore leaves
//! the document untouched for the caller to retry. The `pending` mark is
//! guarded: a job that a worker already picked up is never rewound.

use serde_json::json;

use crate::error::{PipelineError, Result};
use crate::models::{
    AuditAction, DeadLetter, DocumentId, JobId, JobMessage, NewAuditEntry, NewJob,
    ProcessingJob, TaskState, TaskType, TenantId, UserId,
};
use crate::pipeline::Pipeline;
use crate::queue::Enqueued;

pub struct Dispatcher {
    pipeline: Pipeline,
}

impl Dispatcher {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Enqueue `task_type` for a stored document and return the job id.
    pub async fn enqueue(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
        payload: serde_json::Value,
    ) -> Result<JobId> {
        let enqueued = self
            .submit(tenant, document, task_type, payload, None)
            .await?;
        Ok(enqueued.job_id)
    }

    /// Enqueue a downstream stage of `parent`. Deduplicated on
    /// `"<parent_job_id>:<task_type>"`, so a redelivered parent does not
    /// fan out twice.
    pub async fn enqueue_follow_up(
        &self,
        parent: &JobMessage,
        task_type: TaskType,
    ) -> Result<Enqueued> {
        let dedup_key = format!("{}:{}", parent.job_id, task_type);
        let mut payload = match &parent.payload {
            serde_json::Value::Object(map) => serde_json::Value::Object(map.clone()),
            _ => json!({}),
        };
        payload["parent_job_id"] = json!(parent.job_id);
        self.submit(
            &parent.tenant_id,
            &parent.document_id,
            task_type,
            payload,
            Some(dedup_key),
        )
        .await
    }

    async fn submit(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
        payload: serde_json::Value,
        dedup_key: Option<String>,
    ) -> Result<Enqueued> {
        tenant.require()?;
        let store = &self.pipeline.store;
        let doc = store
            .get_document(tenant, document)
            .await?
            .filter(|d| !d.is_deleted())
            .ok_or_else(|| PipelineError::not_found("document", document))?;

        let enqueued = self
            .pipeline
            .queue
            .enqueue(NewJob {
                tenant_id: tenant.clone(),
                document_id: document.clone(),
                task_type,
                payload,
                storage_locator: doc.storage_locator.clone(),
                max_attempts: self.pipeline.settings.retry.max_attempts,
                dedup_key,
            })
            .await?;

        if enqueued.created {
            // A worker may already have leased and finished the job.
            store
                .mark_task_pending(
                    tenant,
                    document,
                    task_type,
                    &enqueued.job_id,
                    &[TaskState::Pending],
                    None,
                )
                .await?;
            store
                .append_audit(
                    &NewAuditEntry::new(tenant, AuditAction::JobEnqueued)
                        .document(document)
                        .job(&enqueued.job_id, task_type),
                )
                .await?;
            tracing::info!(
                tenant = %tenant,
                document_id = %document,
                job_id = %enqueued.job_id,
                task_type = %task_type,
                "job enqueued"
            );
        }
        Ok(enqueued)
    }

    pub async fn get_job(&self, tenant: &TenantId, id: &JobId) -> Result<ProcessingJob> {
        self.pipeline
            .queue
            .get_job(tenant, id)
            .await?
            .ok_or_else(|| PipelineError::not_found("job", id))
    }

    pub async fn dead_letters(&self, tenant: &TenantId, limit: usize) -> Result<Vec<DeadLetter>> {
        self.pipeline.queue.dead_letters(tenant, limit).await
    }

    /// Operator replay of a dead letter.
    pub async fn replay(
        &self,
        tenant: &TenantId,
        dead_letter_id: &str,
        actor: Option<&UserId>,
    ) -> Result<ProcessingJob> {
        let job = self.pipeline.queue.replay(tenant, dead_letter_id).await?;
        let store = &self.pipeline.store;
        store
            .mark_task_pending(
                tenant,
                &job.document_id,
                job.task_type,
                &job.job_id,
                &[TaskState::Failed, TaskState::Pending],
                None,
            )
            .await?;
        let mut entry = NewAuditEntry::new(tenant, AuditAction::JobReplayed)
            .document(&job.document_id)
            .job(&job.job_id, job.task_type)
            .details(json!({ "dead_letter_id": dead_letter_id }));
        if let Some(actor) = actor {
            entry = entry.user(actor);
        }
        store.append_audit(&entry).await?;
        tracing::info!(job_id = %job.job_id, dead_letter_id, "dead letter replayed");
        Ok(job)
    }
}
