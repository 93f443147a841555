//! SQLite-backed [`JobQueue`].
//!
//! Jobs live in the `jobs` table next to the data they describe, so the
//! queue survives restarts and shares the store's WAL file. A lease is one
//! atomic `UPDATE … WHERE job_id = (SELECT … LIMIT 1) RETURNING *`, which
//! both picks the oldest visible job and takes custody of it; two workers
//! can never receive the same lease.
//!
//! Every transaction starts with a write statement so SQLite takes the
//! write lock up front and concurrent leasers queue on the busy timeout
//! instead of failing a read-to-write upgrade.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use docflow_core::models::{
    BlobLocator, DeadLetter, DocumentId, JobId, JobStatus, Lease, NewJob, ProcessingJob, TaskType,
    TenantId,
};
use docflow_core::queue::{deadline_after, expired_error, Enqueued, JobQueue, Nack, NackOutcome};
use docflow_core::{PipelineError, Result};

use crate::db::{col, from_millis, millis, queue_error};

pub struct SqliteQueue {
    pool: SqlitePool,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &SqliteRow) -> Result<ProcessingJob> {
    let task_type: String = col(row, "task_type")?;
    let status: String = col(row, "status")?;
    let payload: String = col(row, "payload_json")?;
    let locator: String = col(row, "storage_locator")?;
    let attempts: i64 = col(row, "attempt_count")?;
    let max_attempts: i64 = col(row, "max_attempts")?;
    Ok(ProcessingJob {
        job_id: JobId::new(col::<String>(row, "job_id")?),
        tenant_id: TenantId::new(col::<String>(row, "tenant_id")?),
        document_id: DocumentId::new(col::<String>(row, "document_id")?),
        task_type: task_type.parse()?,
        payload: serde_json::from_str(&payload)?,
        storage_locator: BlobLocator::parse(&locator)?,
        attempt_count: attempts.max(0) as u32,
        max_attempts: max_attempts.max(1) as u32,
        status: status.parse()?,
        enqueued_at: from_millis(col(row, "enqueued_at")?),
        visibility_deadline: col::<Option<i64>>(row, "visible_at")?.map(from_millis),
        last_error: col(row, "last_error")?,
        dedup_key: col(row, "dedup_key")?,
        updated_at: from_millis(col(row, "updated_at")?),
    })
}

fn dead_letter_from_row(row: &SqliteRow) -> Result<DeadLetter> {
    let task_type: String = col(row, "task_type")?;
    let payload: String = col(row, "payload_json")?;
    let attempts: i64 = col(row, "attempt_count")?;
    Ok(DeadLetter {
        id: col(row, "id")?,
        job_id: JobId::new(col::<String>(row, "job_id")?),
        tenant_id: TenantId::new(col::<String>(row, "tenant_id")?),
        document_id: DocumentId::new(col::<String>(row, "document_id")?),
        task_type: task_type.parse()?,
        payload: serde_json::from_str(&payload)?,
        attempt_count: attempts.max(0) as u32,
        error: col(row, "error")?,
        dead_lettered_at: from_millis(col(row, "dead_lettered_at")?),
        replayed_at: col::<Option<i64>>(row, "replayed_at")?.map(from_millis),
    })
}

/// Mark `job` failed and record its dead letter. The caller owns the
/// transaction.
async fn dead_letter(
    conn: &mut SqliteConnection,
    job: &ProcessingJob,
    error: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    sqlx::query(
        r#"
        UPDATE jobs SET status = ?, visible_at = NULL, lease_token = NULL,
            last_error = ?, updated_at = ?
        WHERE job_id = ?
        "#,
    )
    .bind(JobStatus::FailedPermanent.as_str())
    .bind(error)
    .bind(millis(now))
    .bind(job.job_id.as_str())
    .execute(&mut *conn)
    .await
    .map_err(queue_error)?;

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO dead_letters
            (id, job_id, tenant_id, document_id, task_type, payload_json, attempt_count,
             error, dead_lettered_at, replayed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
        "#,
    )
    .bind(&id)
    .bind(job.job_id.as_str())
    .bind(job.tenant_id.as_str())
    .bind(job.document_id.as_str())
    .bind(job.task_type.as_str())
    .bind(job.payload.to_string())
    .bind(job.attempt_count as i64)
    .bind(error)
    .bind(millis(now))
    .execute(&mut *conn)
    .await
    .map_err(queue_error)?;
    Ok(id)
}

/// Why a token-guarded update matched nothing.
async fn lease_miss(pool: &SqlitePool, lease: &Lease) -> PipelineError {
    let exists: std::result::Result<Option<String>, _> =
        sqlx::query_scalar("SELECT job_id FROM jobs WHERE job_id = ?")
            .bind(lease.job.job_id.as_str())
            .fetch_optional(pool)
            .await;
    match exists {
        Ok(None) => PipelineError::not_found("job", &lease.job.job_id),
        Ok(Some(_)) => PipelineError::LeaseLost(lease.job.job_id.to_string()),
        Err(e) => queue_error(e),
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn enqueue(&self, job: NewJob) -> Result<Enqueued> {
        job.tenant_id.require()?;
        let now = millis(Utc::now());
        let job_id = JobId::generate();
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs
                (job_id, tenant_id, document_id, task_type, payload_json, storage_locator,
                 attempt_count, max_attempts, status, enqueued_at, visible_at, dedup_key, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, NULL, ?, ?)
            ON CONFLICT(dedup_key) DO NOTHING
            "#,
        )
        .bind(job_id.as_str())
        .bind(job.tenant_id.as_str())
        .bind(job.document_id.as_str())
        .bind(job.task_type.as_str())
        .bind(job.payload.to_string())
        .bind(job.storage_locator.as_str())
        .bind(job.max_attempts.max(1) as i64)
        .bind(JobStatus::Pending.as_str())
        .bind(now)
        .bind(job.dedup_key.as_deref())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;

        if inserted.rows_affected() > 0 {
            return Ok(Enqueued {
                job_id,
                created: true,
            });
        }
        let existing: String = sqlx::query_scalar("SELECT job_id FROM jobs WHERE dedup_key = ?")
            .bind(job.dedup_key.as_deref())
            .fetch_one(&self.pool)
            .await
            .map_err(queue_error)?;
        Ok(Enqueued {
            job_id: JobId::new(existing),
            created: false,
        })
    }

    async fn lease(&self, task_type: TaskType, visibility: Duration) -> Result<Option<Lease>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(queue_error)?;

        // Crash-looping jobs: the lease expired and every attempt is used.
        let exhausted = sqlx::query(
            r#"
            UPDATE jobs SET updated_at = ?
            WHERE task_type = ? AND status = ? AND visible_at <= ? AND attempt_count >= max_attempts
            RETURNING *
            "#,
        )
        .bind(millis(now))
        .bind(task_type.as_str())
        .bind(JobStatus::InFlight.as_str())
        .bind(millis(now))
        .fetch_all(&mut *tx)
        .await
        .map_err(queue_error)?;
        for row in &exhausted {
            let job = job_from_row(row)?;
            let id = dead_letter(&mut tx, &job, &expired_error(job.attempt_count), now).await?;
            tracing::warn!(
                job_id = %job.job_id,
                dead_letter_id = %id,
                attempts = job.attempt_count,
                "lease expired with no attempts left"
            );
        }

        let token = Uuid::new_v4().to_string();
        let deadline = deadline_after(now, visibility);
        let row = sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?,
                attempt_count = attempt_count + 1,
                visible_at = ?,
                lease_token = ?,
                updated_at = ?
            WHERE job_id = (
                SELECT job_id FROM jobs
                WHERE task_type = ?
                  AND ((status = ? AND (visible_at IS NULL OR visible_at <= ?))
                    OR (status = ? AND visible_at <= ?))
                ORDER BY enqueued_at, rowid
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(JobStatus::InFlight.as_str())
        .bind(millis(deadline))
        .bind(&token)
        .bind(millis(now))
        .bind(task_type.as_str())
        .bind(JobStatus::Pending.as_str())
        .bind(millis(now))
        .bind(JobStatus::InFlight.as_str())
        .bind(millis(now))
        .fetch_optional(&mut *tx)
        .await
        .map_err(queue_error)?;
        tx.commit().await.map_err(queue_error)?;

        match row {
            Some(row) => Ok(Some(Lease {
                job: job_from_row(&row)?,
                token,
                deadline,
            })),
            None => Ok(None),
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<()> {
        let done = sqlx::query(
            r#"
            UPDATE jobs SET status = ?, visible_at = NULL, lease_token = NULL, updated_at = ?
            WHERE job_id = ? AND lease_token = ? AND status = ?
            "#,
        )
        .bind(JobStatus::Done.as_str())
        .bind(millis(Utc::now()))
        .bind(lease.job.job_id.as_str())
        .bind(&lease.token)
        .bind(JobStatus::InFlight.as_str())
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        if done.rows_affected() == 0 {
            return Err(lease_miss(&self.pool, lease).await);
        }
        Ok(())
    }

    async fn nack(&self, lease: &Lease, nack: Nack) -> Result<NackOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(queue_error)?;
        let row = sqlx::query(
            r#"
            UPDATE jobs SET updated_at = ?
            WHERE job_id = ? AND lease_token = ? AND status = ?
            RETURNING *
            "#,
        )
        .bind(millis(now))
        .bind(lease.job.job_id.as_str())
        .bind(&lease.token)
        .bind(JobStatus::InFlight.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(queue_error)?;
        let Some(row) = row else {
            drop(tx);
            return Err(lease_miss(&self.pool, lease).await);
        };
        let job = job_from_row(&row)?;

        let outcome = match nack {
            Nack::Retry { delay, error } if job.attempt_count < job.max_attempts => {
                let visible_at = deadline_after(now, delay);
                sqlx::query(
                    r#"
                    UPDATE jobs SET status = ?, visible_at = ?, lease_token = NULL,
                        last_error = ?, updated_at = ?
                    WHERE job_id = ?
                    "#,
                )
                .bind(JobStatus::Pending.as_str())
                .bind(millis(visible_at))
                .bind(&error)
                .bind(millis(now))
                .bind(job.job_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(queue_error)?;
                NackOutcome::Requeued { visible_at }
            }
            Nack::Retry { error, .. } | Nack::Permanent { error } => {
                let dead_letter_id = dead_letter(&mut tx, &job, &error, now).await?;
                NackOutcome::DeadLettered { dead_letter_id }
            }
        };
        tx.commit().await.map_err(queue_error)?;
        Ok(outcome)
    }

    async fn get_job(&self, tenant: &TenantId, id: &JobId) -> Result<Option<ProcessingJob>> {
        tenant.require()?;
        let row = sqlx::query("SELECT * FROM jobs WHERE tenant_id = ? AND job_id = ?")
            .bind(tenant.as_str())
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(queue_error)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn dead_letters(&self, tenant: &TenantId, limit: usize) -> Result<Vec<DeadLetter>> {
        tenant.require()?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM dead_letters WHERE tenant_id = ?
            ORDER BY dead_lettered_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(tenant.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(queue_error)?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn replay(&self, tenant: &TenantId, dead_letter_id: &str) -> Result<ProcessingJob> {
        tenant.require()?;
        let now = millis(Utc::now());
        let mut tx = self.pool.begin().await.map_err(queue_error)?;
        let job_id: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE dead_letters SET replayed_at = ?
            WHERE id = ? AND tenant_id = ? AND replayed_at IS NULL
            RETURNING job_id
            "#,
        )
        .bind(now)
        .bind(dead_letter_id)
        .bind(tenant.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(queue_error)?;

        let Some(job_id) = job_id else {
            let seen: Option<String> =
                sqlx::query_scalar("SELECT id FROM dead_letters WHERE id = ? AND tenant_id = ?")
                    .bind(dead_letter_id)
                    .bind(tenant.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(queue_error)?;
            return Err(match seen {
                Some(_) => PipelineError::InvalidTransition(format!(
                    "dead letter {} was already replayed",
                    dead_letter_id
                )),
                None => PipelineError::not_found("dead letter", dead_letter_id),
            });
        };

        let row = sqlx::query(
            r#"
            UPDATE jobs SET status = ?, attempt_count = 0, visible_at = NULL,
                lease_token = NULL, updated_at = ?
            WHERE job_id = ? AND tenant_id = ?
            RETURNING *
            "#,
        )
        .bind(JobStatus::Pending.as_str())
        .bind(now)
        .bind(&job_id)
        .bind(tenant.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(queue_error)?
        .ok_or_else(|| PipelineError::not_found("job", &job_id))?;
        let job = job_from_row(&row)?;
        tx.commit().await.map_err(queue_error)?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::{db, migrate};

    async fn queue() -> (tempfile::TempDir, SqliteQueue) {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_config(&format!(
            "[db]\npath = \"{}\"\n",
            dir.path().join("queue.sqlite").display()
        ))
        .unwrap();
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        (dir, SqliteQueue::new(pool))
    }

    fn new_job(dedup: Option<&str>, max_attempts: u32) -> NewJob {
        NewJob {
            tenant_id: TenantId::from("t1"),
            document_id: DocumentId::from("d1"),
            task_type: TaskType::Ocr,
            payload: serde_json::json!({"ocr_method": "auto"}),
            storage_locator: BlobLocator::parse("tenants/t1/documents/d1/a.txt").unwrap(),
            max_attempts,
            dedup_key: dedup.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn dedup_key_returns_existing_job() {
        let (_dir, q) = queue().await;
        let a = q.enqueue(new_job(Some("j0:indexing"), 3)).await.unwrap();
        let b = q.enqueue(new_job(Some("j0:indexing"), 3)).await.unwrap();
        let c = q.enqueue(new_job(None, 3)).await.unwrap();
        let d = q.enqueue(new_job(None, 3)).await.unwrap();
        assert!(a.created && !b.created);
        assert_eq!(a.job_id, b.job_id);
        assert!(c.created && d.created);
        assert_ne!(c.job_id, d.job_id);
    }

    #[tokio::test]
    async fn lease_is_fifo_and_exclusive() {
        let (_dir, q) = queue().await;
        let first = q.enqueue(new_job(None, 3)).await.unwrap();
        let second = q.enqueue(new_job(None, 3)).await.unwrap();
        let a = q.lease(TaskType::Ocr, Duration::from_secs(60)).await.unwrap().unwrap();
        let b = q.lease(TaskType::Ocr, Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(a.job.job_id, first.job_id);
        assert_eq!(b.job.job_id, second.job_id);
        assert_eq!(a.job.payload["ocr_method"], "auto");
        assert!(q.lease(TaskType::Ocr, Duration::from_secs(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_and_old_token_loses() {
        let (_dir, q) = queue().await;
        q.enqueue(new_job(None, 3)).await.unwrap();
        let first = q.lease(TaskType::Ocr, Duration::ZERO).await.unwrap().unwrap();
        let second = q
            .lease(TaskType::Ocr, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.job.job_id, first.job.job_id);
        assert_eq!(second.job.attempt_count, 2);
        assert!(matches!(
            q.ack(&first).await.unwrap_err(),
            PipelineError::LeaseLost(_)
        ));
        q.ack(&second).await.unwrap();
        let job = q
            .get_job(&TenantId::from("t1"), &second.job.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn retries_converge_on_one_dead_letter() {
        let (_dir, q) = queue().await;
        q.enqueue(new_job(None, 3)).await.unwrap();
        let mut leases = 0;
        while let Some(lease) = q.lease(TaskType::Ocr, Duration::from_secs(60)).await.unwrap() {
            leases += 1;
            q.nack(
                &lease,
                Nack::Retry {
                    delay: Duration::ZERO,
                    error: "timeout".into(),
                },
            )
            .await
            .unwrap();
        }
        assert_eq!(leases, 3);
        let dl = q.dead_letters(&TenantId::from("t1"), 10).await.unwrap();
        assert_eq!(dl.len(), 1);
        assert_eq!(dl[0].attempt_count, 3);
        assert_eq!(dl[0].error, "timeout");
    }

    #[tokio::test]
    async fn crash_loop_is_dead_lettered_on_expiry() {
        let (_dir, q) = queue().await;
        q.enqueue(new_job(None, 2)).await.unwrap();
        q.lease(TaskType::Ocr, Duration::ZERO).await.unwrap().unwrap();
        q.lease(TaskType::Ocr, Duration::ZERO).await.unwrap().unwrap();
        assert!(q.lease(TaskType::Ocr, Duration::ZERO).await.unwrap().is_none());
        assert!(q.lease(TaskType::Ocr, Duration::ZERO).await.unwrap().is_none());
        let dl = q.dead_letters(&TenantId::from("t1"), 10).await.unwrap();
        assert_eq!(dl.len(), 1);
        assert!(dl[0].error.contains("lease expired after 2 attempts"));
    }

    #[tokio::test]
    async fn replay_resets_once_and_is_tenant_scoped() {
        let (_dir, q) = queue().await;
        let tenant = TenantId::from("t1");
        q.enqueue(new_job(None, 3)).await.unwrap();
        let lease = q.lease(TaskType::Ocr, Duration::from_secs(60)).await.unwrap().unwrap();
        let outcome = q
            .nack(&lease, Nack::Permanent { error: "bad pdf".into() })
            .await
            .unwrap();
        let NackOutcome::DeadLettered { dead_letter_id } = outcome else {
            panic!("expected dead letter");
        };
        assert!(matches!(
            q.replay(&TenantId::from("t2"), &dead_letter_id).await.unwrap_err(),
            PipelineError::NotFound { .. }
        ));
        let job = q.replay(&tenant, &dead_letter_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert!(matches!(
            q.replay(&tenant, &dead_letter_id).await.unwrap_err(),
            PipelineError::InvalidTransition(_)
        ));
        let again = q.lease(TaskType::Ocr, Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(again.job.job_id, lease.job.job_id);
        assert_eq!(again.job.attempt_count, 1);
    }
}
