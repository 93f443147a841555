//! Tuning parameters, decoupled from application config.
//!
//! The app crate builds these once from its TOML config and passes them by
//! reference into the dispatcher, workers, and retrieval engine.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::models::TaskType;
use crate::results::SummaryType;

#[derive(Debug, Clone)]
pub struct ChunkParams {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_tokens: 250,
            overlap_tokens: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalParams {
    pub default_top_k: usize,
    pub max_top_k: usize,
    /// Minimum cosine similarity for a chunk to count as context.
    pub min_relevance: f32,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            max_top_k: 50,
            min_relevance: 0.75,
        }
    }
}

/// Queue retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub quota_backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
            quota_backoff_multiplier: 4,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempt` (1-based) failed:
    /// `base * 2^(attempt-1)`, capped at `max_backoff`, times the quota
    /// multiplier for rate-limit failures.
    pub fn backoff(&self, attempt: u32, quota: bool) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_backoff.saturating_mul(1u32 << exp);
        let delay = if quota {
            delay.saturating_mul(self.quota_backoff_multiplier.max(1))
        } else {
            delay
        };
        let cap = if quota {
            self.max_backoff
                .saturating_mul(self.quota_backoff_multiplier.max(1))
        } else {
            self.max_backoff
        };
        delay.min(cap)
    }
}

/// Per-task-type worker settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub visibility: HashMap<TaskType, Duration>,
    pub embed_batch_size: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            visibility: TaskType::ALL
                .iter()
                .map(|t| (*t, t.default_visibility()))
                .collect(),
            embed_batch_size: 16,
        }
    }
}

impl WorkerSettings {
    pub fn visibility_for(&self, task_type: TaskType) -> Duration {
        self.visibility
            .get(&task_type)
            .copied()
            .unwrap_or_else(|| task_type.default_visibility())
    }
}

/// Stage wiring and per-stage behaviour.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Stages enqueued when a stage completes, e.g. `ocr -> [indexing]`.
    pub follow_ups: HashMap<TaskType, Vec<TaskType>>,
    pub chunking: ChunkParams,
    pub summary_type: SummaryType,
    pub max_summary_input_chars: usize,
    /// Input cap for structured extraction and form filling.
    pub max_extraction_input_chars: usize,
    pub extraction_fields: Vec<String>,
    pub form_templates: BTreeMap<String, Vec<String>>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            follow_ups: HashMap::from([(TaskType::Ocr, vec![TaskType::Indexing])]),
            chunking: ChunkParams::default(),
            summary_type: SummaryType::Concise,
            max_summary_input_chars: 50_000,
            max_extraction_input_chars: 50_000,
            extraction_fields: default_extraction_fields(),
            form_templates: BTreeMap::new(),
        }
    }
}

impl PipelineSettings {
    pub fn follow_ups_for(&self, task_type: TaskType) -> &[TaskType] {
        self.follow_ups
            .get(&task_type)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Invoice fields extracted when no field list is configured.
pub fn default_extraction_fields() -> Vec<String> {
    [
        "vendor_name",
        "vendor_address",
        "vendor_tax_id",
        "invoice_number",
        "invoice_date",
        "due_date",
        "subtotal",
        "tax_amount",
        "total_amount",
        "currency",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone)]
pub struct ReviewSettings {
    /// Results below this confidence are flagged `low`.
    pub confidence_threshold: f32,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.8,
        }
    }
}

/// Every tuning parameter the pipeline reads, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub retry: RetryPolicy,
    pub worker: WorkerSettings,
    pub pipeline: PipelineSettings,
    pub retrieval: RetrievalParams,
    pub review: ReviewSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            quota_backoff_multiplier: 4,
        };
        assert_eq!(p.backoff(1, false), Duration::from_secs(1));
        assert_eq!(p.backoff(2, false), Duration::from_secs(2));
        assert_eq!(p.backoff(4, false), Duration::from_secs(8));
        assert_eq!(p.backoff(9, false), Duration::from_secs(10));
        assert_eq!(p.backoff(2, true), Duration::from_secs(8));
        assert!(p.backoff(3, true) > p.backoff(3, false));
    }

    #[test]
    fn zero_base_backoff_retries_immediately() {
        let p = RetryPolicy {
            base_backoff: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert_eq!(p.backoff(3, true), Duration::ZERO);
    }
}
