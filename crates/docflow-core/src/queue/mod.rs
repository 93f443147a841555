//! Durable job queue contract.
//!
//! Delivery is at-least-once. A [`Lease`] gives one worker custody of a job
//! until its deadline; a worker that misses the deadline loses the job to
//! the next [`lease`](JobQueue::lease) call and every later
//! [`ack`](JobQueue::ack)/[`nack`](JobQueue::nack) from it fails with
//! [`PipelineError::LeaseLost`](crate::PipelineError::LeaseLost).
//!
//! Each lease increments `attempt_count`. Once a job has used
//! `max_attempts` it is moved to the dead letters exactly once, whether it
//! got there through repeated nacks or repeated lease expiry.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::{DeadLetter, JobId, Lease, NewJob, ProcessingJob, TaskType, TenantId};

/// Result of an enqueue. `created` is false when the dedup key matched an
/// existing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enqueued {
    pub job_id: JobId,
    pub created: bool,
}

/// Negative acknowledgement.
#[derive(Debug, Clone)]
pub enum Nack {
    /// Make the job visible again after `delay`, unless it has used all of
    /// its attempts.
    Retry { delay: Duration, error: String },
    /// Dead-letter immediately.
    Permanent { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { visible_at: DateTime<Utc> },
    DeadLettered { dead_letter_id: String },
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<Enqueued>;

    /// Lease the oldest visible job of `task_type`, or `None` when idle.
    async fn lease(&self, task_type: TaskType, visibility: Duration) -> Result<Option<Lease>>;

    async fn ack(&self, lease: &Lease) -> Result<()>;

    async fn nack(&self, lease: &Lease, nack: Nack) -> Result<NackOutcome>;

    async fn get_job(&self, tenant: &TenantId, id: &JobId) -> Result<Option<ProcessingJob>>;

    /// Newest first.
    async fn dead_letters(&self, tenant: &TenantId, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Reset a dead-lettered job to `pending` with a fresh attempt budget.
    /// A dead letter can be replayed once.
    async fn replay(&self, tenant: &TenantId, dead_letter_id: &str) -> Result<ProcessingJob>;
}

/// `now + d`, saturating instead of overflowing for absurd durations.
pub fn deadline_after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(d).unwrap_or(TimeDelta::days(3650));
    now.checked_add_signed(delta).unwrap_or(now)
}

/// Error text stored when a crash-looping job runs out of attempts.
pub fn expired_error(attempts: u32) -> String {
    format!("lease expired after {} attempts", attempts)
}
