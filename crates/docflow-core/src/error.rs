//! Error taxonomy for the pipeline.
//!
//! Every failure a worker, store, queue, or primitive can produce is a
//! [`PipelineError`]. The retry decision is never made by matching on
//! message text: [`PipelineError::class`] maps each variant onto a
//! [`FailureClass`], and the worker turns that class into an ack/nack.
//!
//! | Variant | Class | Queue behaviour |
//! |---------|-------|-----------------|
//! | `TransientIo`, `QueueUnavailable`, `LeaseLost` | `Transient` | retry with backoff |
//! | `QuotaExceeded` | `Quota` | retry with longer backoff |
//! | `MalformedInput`, `Rejected`, `EmbeddingVersionMismatch`, `NotFound`, `InvalidTransition`, `Config` | `Permanent` | dead letter |
//! | `IsolationViolation` | `Fatal` | worker halts |

use std::fmt;

use serde::Serialize;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Network or timeout failure talking to a primitive or the store.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// Unreadable blob, unsupported mime type, or an input no retry can fix.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Upstream rate limit or quota.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A tenant predicate was missing or a row crossed tenants.
    #[error("tenant isolation violation: {0}")]
    IsolationViolation(String),

    #[error("embedding version mismatch: expected {expected}, found {found}")]
    EmbeddingVersionMismatch { expected: String, found: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The job queue could not accept or hand out work.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// The caller's lease token no longer owns the job.
    #[error("lease lost for job {0}")]
    LeaseLost(String),

    /// A primitive refused the request (4xx other than rate limiting).
    #[error("request rejected by provider: {0}")]
    Rejected(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// How a failure is treated by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Quota,
    Permanent,
    Fatal,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureClass::Transient => "transient",
            FailureClass::Quota => "quota",
            FailureClass::Permanent => "permanent",
            FailureClass::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

impl PipelineError {
    pub fn class(&self) -> FailureClass {
        match self {
            PipelineError::TransientIo(_)
            | PipelineError::QueueUnavailable(_)
            | PipelineError::LeaseLost(_) => FailureClass::Transient,
            PipelineError::QuotaExceeded(_) => FailureClass::Quota,
            PipelineError::IsolationViolation(_) => FailureClass::Fatal,
            PipelineError::MalformedInput(_)
            | PipelineError::Rejected(_)
            | PipelineError::EmbeddingVersionMismatch { .. }
            | PipelineError::NotFound { .. }
            | PipelineError::InvalidTransition(_)
            | PipelineError::Config(_) => FailureClass::Permanent,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == FailureClass::Fatal
    }

    /// Machine-readable code used by the HTTP layer and dead-letter records.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::TransientIo(_) => "transient_io",
            PipelineError::MalformedInput(_) => "malformed_input",
            PipelineError::QuotaExceeded(_) => "quota_exceeded",
            PipelineError::IsolationViolation(_) => "isolation_violation",
            PipelineError::EmbeddingVersionMismatch { .. } => "embedding_version_mismatch",
            PipelineError::NotFound { .. } => "not_found",
            PipelineError::InvalidTransition(_) => "invalid_transition",
            PipelineError::QueueUnavailable(_) => "queue_unavailable",
            PipelineError::LeaseLost(_) => "lease_lost",
            PipelineError::Rejected(_) => "rejected",
            PipelineError::Config(_) => "config",
        }
    }

    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        PipelineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::MalformedInput(format!("json: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_is_not_plain_transient() {
        assert_eq!(
            PipelineError::QuotaExceeded("429".into()).class(),
            FailureClass::Quota
        );
        assert_eq!(
            PipelineError::TransientIo("reset".into()).class(),
            FailureClass::Transient
        );
    }

    #[test]
    fn isolation_violation_is_fatal() {
        let e = PipelineError::IsolationViolation("row for tenant b".into());
        assert!(e.is_fatal());
        assert_eq!(e.code(), "isolation_violation");
    }

    #[test]
    fn malformed_and_version_mismatch_are_permanent() {
        assert_eq!(
            PipelineError::MalformedInput("bad pdf".into()).class(),
            FailureClass::Permanent
        );
        let e = PipelineError::EmbeddingVersionMismatch {
            expected: "a/3".into(),
            found: "b/3".into(),
        };
        assert_eq!(e.class(), FailureClass::Permanent);
        assert!(e.to_string().contains("a/3"));
    }
}
