//! In-memory [`JobQueue`] with the same lease semantics as the SQLite
//! queue. Used by unit tests and single-process embedding.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::models::{
    DeadLetter, JobId, JobStatus, Lease, NewJob, ProcessingJob, TaskType, TenantId,
};

use super::{deadline_after, expired_error, Enqueued, JobQueue, Nack, NackOutcome};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, ProcessingJob>,
    tokens: HashMap<JobId, String>,
    dedup: HashMap<String, JobId>,
    dead_letters: Vec<DeadLetter>,
    /// Set to simulate an outage.
    unavailable: bool,
}

impl Inner {
    fn dead_letter(&mut self, job_id: &JobId, error: String, now: DateTime<Utc>) -> Result<String> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| PipelineError::not_found("job", job_id))?;
        job.status = JobStatus::FailedPermanent;
        job.visibility_deadline = None;
        job.last_error = Some(error.clone());
        job.updated_at = now;
        let entry = DeadLetter {
            id: Uuid::new_v4().to_string(),
            job_id: job.job_id.clone(),
            tenant_id: job.tenant_id.clone(),
            document_id: job.document_id.clone(),
            task_type: job.task_type,
            payload: job.payload.clone(),
            attempt_count: job.attempt_count,
            error,
            dead_lettered_at: now,
            replayed_at: None,
        };
        let id = entry.id.clone();
        self.tokens.remove(job_id);
        self.dead_letters.push(entry);
        Ok(id)
    }

    fn check_token(&self, lease: &Lease) -> Result<()> {
        let job = self
            .jobs
            .get(&lease.job.job_id)
            .ok_or_else(|| PipelineError::not_found("job", &lease.job.job_id))?;
        let owned = job.status == JobStatus::InFlight
            && self.tokens.get(&lease.job.job_id) == Some(&lease.token);
        if !owned {
            return Err(PipelineError::LeaseLost(lease.job.job_id.to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryQueue {
    inner: Mutex<Inner>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `QueueUnavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| PipelineError::QueueUnavailable("queue lock poisoned".to_string()))?;
        if inner.unavailable {
            return Err(PipelineError::QueueUnavailable(
                "queue is not accepting requests".to_string(),
            ));
        }
        Ok(inner)
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, job: NewJob) -> Result<Enqueued> {
        job.tenant_id.require()?;
        let mut inner = self.lock()?;
        if let Some(key) = &job.dedup_key {
            if let Some(existing) = inner.dedup.get(key) {
                return Ok(Enqueued {
                    job_id: existing.clone(),
                    created: false,
                });
            }
        }
        let now = Utc::now();
        let row = ProcessingJob {
            job_id: JobId::generate(),
            tenant_id: job.tenant_id,
            document_id: job.document_id,
            task_type: job.task_type,
            payload: job.payload,
            storage_locator: job.storage_locator,
            attempt_count: 0,
            max_attempts: job.max_attempts.max(1),
            status: JobStatus::Pending,
            enqueued_at: now,
            visibility_deadline: None,
            last_error: None,
            dedup_key: job.dedup_key,
            updated_at: now,
        };
        let job_id = row.job_id.clone();
        if let Some(key) = &row.dedup_key {
            inner.dedup.insert(key.clone(), job_id.clone());
        }
        inner.jobs.insert(job_id.clone(), row);
        Ok(Enqueued {
            job_id,
            created: true,
        })
    }

    async fn lease(&self, task_type: TaskType, visibility: Duration) -> Result<Option<Lease>> {
        let mut inner = self.lock()?;
        let now = Utc::now();

        let exhausted: Vec<(JobId, u32)> = inner
            .jobs
            .values()
            .filter(|j| {
                j.task_type == task_type
                    && j.status == JobStatus::InFlight
                    && j.visibility_deadline.is_some_and(|d| d <= now)
                    && j.attempt_count >= j.max_attempts
            })
            .map(|j| (j.job_id.clone(), j.attempt_count))
            .collect();
        for (id, attempts) in exhausted {
            inner.dead_letter(&id, expired_error(attempts), now)?;
        }

        let candidate = inner
            .jobs
            .values()
            .filter(|j| j.task_type == task_type)
            .filter(|j| match j.status {
                JobStatus::Pending => j.visibility_deadline.is_none_or(|d| d <= now),
                JobStatus::InFlight => j.visibility_deadline.is_some_and(|d| d <= now),
                JobStatus::Done | JobStatus::FailedPermanent => false,
            })
            .min_by(|a, b| {
                a.enqueued_at
                    .cmp(&b.enqueued_at)
                    .then_with(|| a.job_id.cmp(&b.job_id))
            })
            .map(|j| j.job_id.clone());

        let Some(job_id) = candidate else {
            return Ok(None);
        };
        let token = Uuid::new_v4().to_string();
        let deadline = deadline_after(now, visibility);
        let job = match inner.jobs.get_mut(&job_id) {
            Some(job) => {
                job.status = JobStatus::InFlight;
                job.attempt_count += 1;
                job.visibility_deadline = Some(deadline);
                job.updated_at = now;
                job.clone()
            }
            None => return Ok(None),
        };
        inner.tokens.insert(job_id, token.clone());
        Ok(Some(Lease {
            job,
            token,
            deadline,
        }))
    }

    async fn ack(&self, lease: &Lease) -> Result<()> {
        let mut inner = self.lock()?;
        inner.check_token(lease)?;
        let now = Utc::now();
        if let Some(job) = inner.jobs.get_mut(&lease.job.job_id) {
            job.status = JobStatus::Done;
            job.visibility_deadline = None;
            job.updated_at = now;
        }
        inner.tokens.remove(&lease.job.job_id);
        Ok(())
    }

    async fn nack(&self, lease: &Lease, nack: Nack) -> Result<NackOutcome> {
        let mut inner = self.lock()?;
        inner.check_token(lease)?;
        let now = Utc::now();
        let job_id = &lease.job.job_id;
        let (attempts, max) = match inner.jobs.get(job_id) {
            Some(j) => (j.attempt_count, j.max_attempts),
            None => return Err(PipelineError::not_found("job", job_id)),
        };

        match nack {
            Nack::Retry { delay, error } if attempts < max => {
                let visible_at = deadline_after(now, delay);
                if let Some(job) = inner.jobs.get_mut(job_id) {
                    job.status = JobStatus::Pending;
                    job.visibility_deadline = Some(visible_at);
                    job.last_error = Some(error);
                    job.updated_at = now;
                }
                inner.tokens.remove(job_id);
                Ok(NackOutcome::Requeued { visible_at })
            }
            Nack::Retry { error, .. } | Nack::Permanent { error } => {
                let dead_letter_id = inner.dead_letter(job_id, error, now)?;
                Ok(NackOutcome::DeadLettered { dead_letter_id })
            }
        }
    }

    async fn get_job(&self, tenant: &TenantId, id: &JobId) -> Result<Option<ProcessingJob>> {
        tenant.require()?;
        let inner = self.lock()?;
        Ok(inner
            .jobs
            .get(id)
            .filter(|j| &j.tenant_id == tenant)
            .cloned())
    }

    async fn dead_letters(&self, tenant: &TenantId, limit: usize) -> Result<Vec<DeadLetter>> {
        tenant.require()?;
        let inner = self.lock()?;
        Ok(inner
            .dead_letters
            .iter()
            .rev()
            .filter(|d| &d.tenant_id == tenant)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replay(&self, tenant: &TenantId, dead_letter_id: &str) -> Result<ProcessingJob> {
        tenant.require()?;
        let mut inner = self.lock()?;
        let now = Utc::now();
        let entry = inner
            .dead_letters
            .iter_mut()
            .find(|d| d.id == dead_letter_id && &d.tenant_id == tenant)
            .ok_or_else(|| PipelineError::not_found("dead letter", dead_letter_id))?;
        if entry.replayed_at.is_some() {
            return Err(PipelineError::InvalidTransition(format!(
                "dead letter {} was already replayed",
                dead_letter_id
            )));
        }
        entry.replayed_at = Some(now);
        let job_id = entry.job_id.clone();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| PipelineError::not_found("job", &job_id))?;
        job.status = JobStatus::Pending;
        job.attempt_count = 0;
        job.visibility_deadline = None;
        job.updated_at = now;
        Ok(job.clone())
    }
}
