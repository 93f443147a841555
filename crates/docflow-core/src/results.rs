//! Task-specific structured outputs and the stored result row.
//!
//! One [`StoredResult`] exists per `(document_id, task_type)`. The machine
//! output in [`StoredResult::output`] is never edited in place; human
//! changes live in a separate list of [`Correction`]s (see
//! [`review`](crate::review)).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{BlobLocator, DocumentId, JobId, TaskType, TenantId, UserId};

/// One extracted field with the primitive's confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub value: serde_json::Value,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub fields: BTreeMap<String, ExtractedField>,
    pub average_confidence: f32,
    pub model_used: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub text: String,
    pub confidence: f32,
    pub page_count: u32,
    pub method: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryType {
    Concise,
    Detailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryOutput {
    pub summary: String,
    pub key_points: Vec<String>,
    pub summary_type: SummaryType,
    pub word_count: usize,
    pub original_word_count: usize,
    pub compression_ratio: f32,
    pub model_used: String,
}

/// Record of an indexing run. A zero `chunk_count` with `indexed = true`
/// means the document had nothing to index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingOutput {
    pub chunk_count: usize,
    pub embedding_model: String,
    pub embedding_dims: usize,
    pub generation: i64,
    pub indexed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormFillOutput {
    pub template: String,
    pub fields: BTreeMap<String, ExtractedField>,
    pub missing_fields: Vec<String>,
    pub output_locator: BlobLocator,
    pub model_used: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutput {
    Extraction(ExtractionOutput),
    Ocr(OcrOutput),
    Summary(SummaryOutput),
    Indexing(IndexingOutput),
    FormFill(FormFillOutput),
}

impl TaskOutput {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskOutput::Extraction(_) => TaskType::Extraction,
            TaskOutput::Ocr(_) => TaskType::Ocr,
            TaskOutput::Summary(_) => TaskType::Summarization,
            TaskOutput::Indexing(_) => TaskType::Indexing,
            TaskOutput::FormFill(_) => TaskType::FormFilling,
        }
    }

    /// Quality signal used for the review confidence band.
    pub fn confidence(&self) -> Option<f32> {
        match self {
            TaskOutput::Extraction(e) => Some(e.average_confidence),
            TaskOutput::Ocr(o) => Some(o.confidence),
            TaskOutput::FormFill(f) => Some(average_confidence(&f.fields)),
            TaskOutput::Summary(_) | TaskOutput::Indexing(_) => None,
        }
    }

    pub fn model_used(&self) -> Option<&str> {
        match self {
            TaskOutput::Extraction(e) => Some(&e.model_used),
            TaskOutput::Ocr(o) => Some(&o.method),
            TaskOutput::Summary(s) => Some(&s.model_used),
            TaskOutput::Indexing(i) => Some(&i.embedding_model),
            TaskOutput::FormFill(f) => Some(&f.model_used),
        }
    }

    /// Field map the correction overlay applies to.
    ///
    /// Structured outputs expose their extracted fields; free-text outputs
    /// expose their main text fields so a human can amend them too.
    pub fn field_values(&self) -> BTreeMap<String, serde_json::Value> {
        match self {
            TaskOutput::Extraction(e) => e
                .fields
                .iter()
                .map(|(k, f)| (k.clone(), f.value.clone()))
                .collect(),
            TaskOutput::FormFill(f) => f
                .fields
                .iter()
                .map(|(k, f)| (k.clone(), f.value.clone()))
                .collect(),
            TaskOutput::Ocr(o) => BTreeMap::from([("text".to_string(), o.text.clone().into())]),
            TaskOutput::Summary(s) => BTreeMap::from([
                ("summary".to_string(), s.summary.clone().into()),
                ("key_points".to_string(), serde_json::json!(s.key_points)),
            ]),
            TaskOutput::Indexing(_) => BTreeMap::new(),
        }
    }
}

pub fn average_confidence(fields: &BTreeMap<String, ExtractedField>) -> f32 {
    if fields.is_empty() {
        return 0.0;
    }
    fields.values().map(|f| f.confidence).sum::<f32>() / fields.len() as f32
}

/// Review lifecycle of a result. See [`review`](crate::review) for the
/// allowed transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Extracted,
    Reviewed,
    Validated,
    Rejected,
}

impl ReviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewState::Extracted => "extracted",
            ReviewState::Reviewed => "reviewed",
            ReviewState::Validated => "validated",
            ReviewState::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "extracted" => Ok(ReviewState::Extracted),
            "reviewed" => Ok(ReviewState::Reviewed),
            "validated" => Ok(ReviewState::Validated),
            "rejected" => Ok(ReviewState::Rejected),
            other => Err(crate::PipelineError::MalformedInput(format!(
                "unknown review state '{}'",
                other
            ))),
        }
    }
}

/// The persisted result row for one `(document_id, task_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResult {
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub task_type: TaskType,
    /// The job whose execution produced `output`.
    pub job_id: JobId,
    pub output: TaskOutput,
    pub confidence: Option<f32>,
    pub model_used: Option<String>,
    pub review_state: ReviewState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One field-level human change. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub id: i64,
    pub field: String,
    pub value: serde_json::Value,
    pub corrected_by: UserId,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Steps 3 and 4 of a worker run: the result to upsert plus the status
/// transition and audit entry that go with it.
#[derive(Debug, Clone)]
pub struct TaskCommit {
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub job_id: JobId,
    pub output: TaskOutput,
}

impl TaskCommit {
    pub fn task_type(&self) -> TaskType {
        self.output.task_type()
    }
}

/// What an idempotent upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// First result for this natural key.
    Inserted,
    /// Same job already wrote this row; nothing changed.
    Unchanged,
    /// A newer job replaced unreviewed machine output.
    Superseded,
    /// The row has been reviewed; machine output is frozen.
    Frozen,
}

/// Audit details for a `task_completed` entry. A superseding commit keeps
/// the replaced job and its output so the earlier answer stays inspectable.
pub fn completion_details(
    outcome: UpsertOutcome,
    previous: Option<&StoredResult>,
) -> serde_json::Value {
    let mut details = serde_json::json!({ "outcome": outcome });
    if let (UpsertOutcome::Superseded, Some(previous)) = (outcome, previous) {
        details["superseded"] = serde_json::json!({
            "job_id": previous.job_id,
            "output": previous.output,
            "model_used": previous.model_used,
        });
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_serializes_with_kind_tag() {
        let out = TaskOutput::Indexing(IndexingOutput {
            chunk_count: 0,
            embedding_model: "m".into(),
            embedding_dims: 8,
            generation: 1,
            indexed: true,
        });
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["kind"], "indexing");
        assert_eq!(v["indexed"], true);
        let back: TaskOutput = serde_json::from_value(v).unwrap();
        assert_eq!(back.task_type(), TaskType::Indexing);
    }

    #[test]
    fn average_confidence_of_empty_fields_is_zero() {
        assert_eq!(average_confidence(&BTreeMap::new()), 0.0);
        let fields = BTreeMap::from([
            (
                "a".to_string(),
                ExtractedField {
                    value: "x".into(),
                    confidence: 0.5,
                },
            ),
            (
                "b".to_string(),
                ExtractedField {
                    value: "y".into(),
                    confidence: 1.0,
                },
            ),
        ]);
        assert!((average_confidence(&fields) - 0.75).abs() < 1e-6);
    }
}
