//! Worker state machine.
//!
//! ```text
//! idle ─lease─▶ leased ─▶ executing ─┬─▶ ack
//!                                    ├─▶ nack(retry)     transient, quota
//!                                    ├─▶ nack(permanent) malformed, rejected, ...
//!                                    └─▶ halt            isolation violation
//! ```
//!
//! Every task type runs the same steps: fetch the blob, run the handler,
//! upsert the result with its status and audit entry, enqueue follow-up
//! stages, ack. Each step is idempotent, so a job redelivered after a crash
//! at any point converges on the same stored state.

use serde::Serialize;
use serde_json::json;
use tracing::Instrument;

use crate::error::{FailureClass, PipelineError, Result};
use crate::handlers;
use crate::models::{
    AuditAction, Document, JobMessage, Lease, NewAuditEntry, TaskState, TaskType,
};
use crate::pipeline::Pipeline;
use crate::queue::{Nack, NackOutcome};
use crate::results::{TaskCommit, UpsertOutcome};

/// What one [`Worker::process_one`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStep {
    /// No visible job.
    Idle,
    Acked,
    /// Nacked for retry; the job becomes visible again after a backoff.
    Retrying,
    DeadLettered,
    /// The document or its blob was gone; acked without work.
    Skipped,
}

enum Execution {
    Skipped(&'static str),
    Committed(UpsertOutcome),
}

pub struct Worker {
    pipeline: Pipeline,
    id: String,
}

impl Worker {
    pub fn new(pipeline: Pipeline, id: impl Into<String>) -> Self {
        Self {
            pipeline,
            id: id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lease and process at most one job of `task_type`.
    ///
    /// Returns `Err` only for fatal failures (the caller must stop this
    /// worker) and for queue or store errors outside a lease.
    pub async fn process_one(&self, task_type: TaskType) -> Result<WorkerStep> {
        let visibility = self.pipeline.settings.worker.visibility_for(task_type);
        let Some(lease) = self.pipeline.queue.lease(task_type, visibility).await? else {
            return Ok(WorkerStep::Idle);
        };
        let msg = lease.job.message();
        let span = tracing::info_span!(
            "job",
            worker = %self.id,
            job_id = %msg.job_id,
            tenant = %msg.tenant_id,
            document_id = %msg.document_id,
            task_type = %task_type,
            attempt = msg.attempt_count,
        );
        self.handle(&lease, &msg).instrument(span).await
    }

    async fn handle(&self, lease: &Lease, msg: &JobMessage) -> Result<WorkerStep> {
        match self.execute(msg).await {
            Ok(Execution::Skipped(reason)) => {
                self.pipeline
                    .store
                    .append_audit(
                        &NewAuditEntry::new(&msg.tenant_id, AuditAction::JobSkipped)
                            .document(&msg.document_id)
                            .job(&msg.job_id, msg.task_type)
                            .details(json!({ "reason": reason })),
                    )
                    .await?;
                self.pipeline.queue.ack(lease).await?;
                tracing::info!(reason, "job skipped");
                Ok(WorkerStep::Skipped)
            }
            Ok(Execution::Committed(outcome)) => {
                if let Err(e) = self.enqueue_follow_ups(msg).await {
                    return self.fail(lease, msg, e).await;
                }
                self.pipeline.queue.ack(lease).await?;
                tracing::info!(outcome = ?outcome, "job acked");
                Ok(WorkerStep::Acked)
            }
            Err(e) => self.fail(lease, msg, e).await,
        }
    }

    async fn execute(&self, msg: &JobMessage) -> Result<Execution> {
        let store = &self.pipeline.store;
        let tenant_prefix = format!("tenants/{}/", msg.tenant_id.require()?);
        if !msg.storage_locator.as_str().starts_with(&tenant_prefix) {
            return Err(PipelineError::IsolationViolation(format!(
                "job {} points at a blob outside tenant {}",
                msg.job_id, msg.tenant_id
            )));
        }

        let doc: Document = match store.get_document(&msg.tenant_id, &msg.document_id).await? {
            Some(doc) if doc.is_deleted() => return Ok(Execution::Skipped("document deleted")),
            Some(doc) => doc,
            None => return Ok(Execution::Skipped("document not found")),
        };
        let Some(blob) = self.pipeline.blobs.get(&msg.storage_locator).await? else {
            return Ok(Execution::Skipped("blob missing"));
        };

        store
            .set_task_state(
                &msg.tenant_id,
                &msg.document_id,
                msg.task_type,
                TaskState::Processing,
                Some(&msg.job_id),
                None,
            )
            .await?;
        store
            .append_audit(
                &NewAuditEntry::new(&msg.tenant_id, AuditAction::TaskStarted)
                    .document(&msg.document_id)
                    .job(&msg.job_id, msg.task_type)
                    .details(json!({ "attempt": msg.attempt_count, "worker": self.id })),
            )
            .await?;

        let output = handlers::run(&self.pipeline, msg, &doc, &blob).await?;
        let outcome = store
            .commit_task(&TaskCommit {
                tenant_id: msg.tenant_id.clone(),
                document_id: msg.document_id.clone(),
                job_id: msg.job_id.clone(),
                output,
            })
            .await?;
        Ok(Execution::Committed(outcome))
    }

    async fn enqueue_follow_ups(&self, msg: &JobMessage) -> Result<()> {
        let dispatcher = self.pipeline.dispatcher();
        for next in self.pipeline.settings.pipeline.follow_ups_for(msg.task_type) {
            let enqueued = dispatcher.enqueue_follow_up(msg, *next).await?;
            tracing::debug!(
                follow_up = %next,
                job_id = %enqueued.job_id,
                created = enqueued.created,
                "follow-up stage"
            );
        }
        Ok(())
    }

    /// Turn a failure into a nack (or a halt) according to its class.
    async fn fail(&self, lease: &Lease, msg: &JobMessage, error: PipelineError) -> Result<WorkerStep> {
        let class = error.class();
        let nack = match class {
            FailureClass::Fatal => {
                tracing::error!(error = %error, "fatal error; leaving job unacked");
                return Err(error);
            }
            FailureClass::Transient | FailureClass::Quota => Nack::Retry {
                delay: self
                    .pipeline
                    .settings
                    .retry
                    .backoff(msg.attempt_count, class == FailureClass::Quota),
                error: error.to_string(),
            },
            FailureClass::Permanent => Nack::Permanent {
                error: error.to_string(),
            },
        };

        let store = &self.pipeline.store;
        match self.pipeline.queue.nack(lease, nack).await? {
            NackOutcome::Requeued { visible_at } => {
                // Another worker may have leased and finished the requeued job.
                store
                    .mark_task_pending(
                        &msg.tenant_id,
                        &msg.document_id,
                        msg.task_type,
                        &msg.job_id,
                        &[TaskState::Processing, TaskState::Pending],
                        Some(&error.to_string()),
                    )
                    .await?;
                store
                    .append_audit(
                        &NewAuditEntry::new(&msg.tenant_id, AuditAction::TaskRetried)
                            .document(&msg.document_id)
                            .job(&msg.job_id, msg.task_type)
                            .details(json!({
                                "attempt": msg.attempt_count,
                                "class": class,
                                "error": error.to_string(),
                                "visible_at": visible_at,
                            })),
                    )
                    .await?;
                tracing::warn!(error = %error, class = %class, %visible_at, "job nacked for retry");
                Ok(WorkerStep::Retrying)
            }
            NackOutcome::DeadLettered { dead_letter_id } => {
                self.record_failure(msg, &error, class, &dead_letter_id).await?;
                tracing::error!(error = %error, class = %class, dead_letter_id = %dead_letter_id, "job dead-lettered");
                Ok(WorkerStep::DeadLettered)
            }
        }
    }

    async fn record_failure(
        &self,
        msg: &JobMessage,
        error: &PipelineError,
        class: FailureClass,
        dead_letter_id: &str,
    ) -> Result<()> {
        let store = &self.pipeline.store;
        let store_result = store
            .set_task_state(
                &msg.tenant_id,
                &msg.document_id,
                msg.task_type,
                TaskState::Failed,
                Some(&msg.job_id),
                Some(&error.to_string()),
            )
            .await;
        match store_result {
            Ok(_) => {}
            // The document may have been removed while the job ran.
            Err(PipelineError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        for action in [AuditAction::TaskFailed, AuditAction::JobDeadLettered] {
            store
                .append_audit(
                    &NewAuditEntry::new(&msg.tenant_id, action)
                        .document(&msg.document_id)
                        .job(&msg.job_id, msg.task_type)
                        .details(json!({
                            "attempt": msg.attempt_count,
                            "class": class,
                            "code": error.code(),
                            "error": error.to_string(),
                            "dead_letter_id": dead_letter_id,
                        })),
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::Upload;
    use crate::models::{AuditQuery, DocumentStatus, JobStatus, TenantId, UserId};
    use crate::results::TaskOutput;
    use crate::testing::{EagerQueue, FlakyOcr, ScriptedGenerator, TestPipeline};

    #[tokio::test]
    async fn ocr_job_commits_and_fans_out_to_indexing() {
        let t = TestPipeline::new();
        let doc = t.upload("t1", "memo.txt", b"The budget was approved.").await;
        t.enqueue(&doc, TaskType::Ocr).await;

        let worker = t.pipeline.worker("w1");
        assert_eq!(worker.process_one(TaskType::Ocr).await.unwrap(), WorkerStep::Acked);
        assert_eq!(worker.process_one(TaskType::Ocr).await.unwrap(), WorkerStep::Idle);
        assert_eq!(
            worker.process_one(TaskType::Indexing).await.unwrap(),
            WorkerStep::Acked
        );

        let result = t
            .pipeline
            .store
            .get_result(&doc.tenant_id, &doc.id, TaskType::Ocr)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result.output, TaskOutput::Ocr(ref o) if o.text == "The budget was approved."));
        let stored = t
            .pipeline
            .store
            .get_document(&doc.tenant_id, &doc.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, DocumentStatus::Completed);
        let chunks = t
            .pipeline
            .store
            .chunks_for_document(&doc.tenant_id, &doc.id)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_dead_letter_once() {
        let t = TestPipeline::with_ocr(FlakyOcr::failing(100)).with_max_attempts(3);
        let doc = t.upload("t1", "scan.txt", b"text").await;
        t.enqueue(&doc, TaskType::Ocr).await;
        let worker = t.pipeline.worker("w1");

        let mut steps = Vec::new();
        loop {
            match worker.process_one(TaskType::Ocr).await.unwrap() {
                WorkerStep::Idle => break,
                step => steps.push(step),
            }
        }
        assert_eq!(
            steps,
            vec![WorkerStep::Retrying, WorkerStep::Retrying, WorkerStep::DeadLettered]
        );
        let dead = t.pipeline.queue.dead_letters(&doc.tenant_id, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        let statuses = t.pipeline.store.task_statuses(&doc.tenant_id, &doc.id).await.unwrap();
        assert_eq!(statuses[0].state, TaskState::Failed);
    }

    #[tokio::test]
    async fn retry_finished_by_another_worker_stays_completed() {
        // The first generation call is rate limited; the requeued job is
        // picked up and finished inside the nack.
        let pipeline = EagerQueue::pipeline(ScriptedGenerator::default_replies().rate_limited(1));
        let doc = pipeline
            .intake()
            .upload(Upload {
                tenant_id: TenantId::from("t1"),
                user_id: UserId::from("u1"),
                filename: "memo.txt".to_string(),
                mime_type: "text/plain".to_string(),
                bytes: b"Headcount stayed flat through the year.".to_vec(),
            })
            .await
            .unwrap();
        let job_id = pipeline
            .dispatcher()
            .enqueue(&doc.tenant_id, &doc.id, TaskType::Summarization, json!({}))
            .await
            .unwrap();

        let job = pipeline.dispatcher().get_job(&doc.tenant_id, &job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempt_count, 2);
        let statuses = pipeline.store.task_statuses(&doc.tenant_id, &doc.id).await.unwrap();
        assert_eq!(statuses[0].state, TaskState::Completed);
        let audit = pipeline
            .store
            .audit_log(&doc.tenant_id, &AuditQuery::default())
            .await
            .unwrap();
        assert!(audit.iter().any(|e| e.action == AuditAction::TaskRetried));
    }

    #[tokio::test]
    async fn transient_failures_below_the_limit_end_in_one_result() {
        let t = TestPipeline::with_ocr(FlakyOcr::failing(2)).with_max_attempts(3);
        let doc = t.upload("t1", "scan.txt", b"lease renewed for two years").await;
        let job_id = t.enqueue(&doc, TaskType::Ocr).await;

        assert_eq!(
            t.drain(TaskType::Ocr).await,
            vec![WorkerStep::Retrying, WorkerStep::Retrying, WorkerStep::Acked]
        );
        assert_eq!(t.ocr.calls(), 3);
        let job = t.pipeline.dispatcher().get_job(&doc.tenant_id, &job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(t.pipeline.queue.dead_letters(&doc.tenant_id, 10).await.unwrap().is_empty());

        let result = t
            .pipeline
            .store
            .get_result(&doc.tenant_id, &doc.id, TaskType::Ocr)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.job_id, job_id);
        let audit = t
            .pipeline
            .store
            .audit_log(&doc.tenant_id, &AuditQuery::default())
            .await
            .unwrap();
        let count = |action| audit.iter().filter(|e| e.action == action).count();
        assert_eq!(count(AuditAction::TaskRetried), 2);
        assert_eq!(count(AuditAction::TaskCompleted), 1);
        assert_eq!(t.task_states(&doc).await[&TaskType::Ocr], TaskState::Completed);
    }

    #[tokio::test]
    async fn rate_limit_backs_off_longer_than_transient_failure() {
        let t = TestPipeline::with_generator(ScriptedGenerator::default_replies().rate_limited(1))
            .with_settings(|s| s.retry.base_backoff = std::time::Duration::from_secs(10));
        let doc = t.upload("t1", "memo.txt", b"Office move planned for May.").await;
        let job_id = t.enqueue(&doc, TaskType::Summarization).await;
        let worker = t.pipeline.worker("w1");

        let before = chrono::Utc::now();
        assert_eq!(
            worker.process_one(TaskType::Summarization).await.unwrap(),
            WorkerStep::Retrying
        );
        let after = chrono::Utc::now();

        let retry = &t.pipeline.settings.retry;
        let quota_delay = retry.backoff(1, true);
        assert!(quota_delay > retry.backoff(1, false));
        let job = t.pipeline.dispatcher().get_job(&doc.tenant_id, &job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        let visible_at = job.visibility_deadline.unwrap();
        assert!(visible_at >= crate::queue::deadline_after(before, quota_delay));
        assert!(visible_at <= crate::queue::deadline_after(after, quota_delay));

        let audit = t
            .pipeline
            .store
            .audit_log(&doc.tenant_id, &AuditQuery::default())
            .await
            .unwrap();
        let retried = audit
            .iter()
            .find(|e| e.action == AuditAction::TaskRetried)
            .unwrap();
        assert_eq!(retried.details["class"], "quota");

        // Not visible again until the backoff has passed.
        assert_eq!(
            worker.process_one(TaskType::Summarization).await.unwrap(),
            WorkerStep::Idle
        );
    }

    #[tokio::test]
    async fn malformed_input_dead_letters_without_retry() {
        let t = TestPipeline::new();
        let doc = t.upload_with_mime("t1", "photo.bin", b"\xff\xfe\x00", "image/png").await;
        t.enqueue(&doc, TaskType::Ocr).await;
        let step = t.pipeline.worker("w1").process_one(TaskType::Ocr).await.unwrap();
        assert_eq!(step, WorkerStep::DeadLettered);
        let stored = t
            .pipeline
            .store
            .get_document(&doc.tenant_id, &doc.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, DocumentStatus::Failed);
    }

    #[tokio::test]
    async fn deleted_document_is_skipped_and_acked() {
        let t = TestPipeline::new();
        let doc = t.upload("t1", "a.txt", b"hello").await;
        let job_id = t.enqueue(&doc, TaskType::Summarization).await;
        t.pipeline
            .intake()
            .delete(&doc.tenant_id, &doc.id, &"admin".into())
            .await
            .unwrap();

        let step = t
            .pipeline
            .worker("w1")
            .process_one(TaskType::Summarization)
            .await
            .unwrap();
        assert_eq!(step, WorkerStep::Skipped);
        let job = t.pipeline.dispatcher().get_job(&doc.tenant_id, &job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Done);
        let audit = t
            .pipeline
            .store
            .audit_log(&doc.tenant_id, &AuditQuery::default())
            .await
            .unwrap();
        assert!(audit.iter().any(|e| e.action == AuditAction::JobSkipped));
    }

    #[tokio::test]
    async fn failure_in_one_task_type_leaves_others_alone() {
        let t = TestPipeline::new();
        let doc = t.upload("t1", "a.txt", b"hello there").await;
        t.enqueue(&doc, TaskType::Ocr).await;
        t.enqueue_with(&doc, TaskType::FormFilling, json!({"template": "missing"}))
            .await;
        let worker = t.pipeline.worker("w1");
        assert_eq!(
            worker.process_one(TaskType::FormFilling).await.unwrap(),
            WorkerStep::DeadLettered
        );
        assert_eq!(worker.process_one(TaskType::Ocr).await.unwrap(), WorkerStep::Acked);
        let statuses = t.pipeline.store.task_statuses(&doc.tenant_id, &doc.id).await.unwrap();
        let state = |tt| statuses.iter().find(|s| s.task_type == tt).map(|s| s.state);
        assert_eq!(state(TaskType::Ocr), Some(TaskState::Completed));
        assert_eq!(state(TaskType::FormFilling), Some(TaskState::Failed));
    }
}
