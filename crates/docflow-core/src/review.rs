//! Human-correction and validation workflow.
//!
//! ```text
//! extracted(low|high) ──correct/mark_reviewed──▶ reviewed ──validate──▶ validated
//!                                                  │  ▲
//!                                                  │  └─ correct
//!                                                  └──────reject──────▶ rejected
//! ```
//!
//! Corrections never touch the machine output. Each is appended as a
//! [`Correction`] and applied as a field-level overlay when building the
//! [`EffectiveResult`], so both "what the model produced" and "what a human
//! changed" stay inspectable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::models::{AuditAction, DocumentId, TaskType, TenantId, UserId};
use crate::pipeline::Pipeline;
use crate::results::{Correction, ReviewState, StoredResult, TaskOutput};
use crate::settings::ReviewSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReviewAction {
    Correct {
        field: String,
        value: serde_json::Value,
        #[serde(default)]
        note: Option<String>,
    },
    MarkReviewed {
        #[serde(default)]
        note: Option<String>,
    },
    Validate {
        #[serde(default)]
        note: Option<String>,
    },
    Reject {
        reason: String,
    },
}

impl ReviewAction {
    pub fn audit_action(&self) -> AuditAction {
        match self {
            ReviewAction::Correct { .. } => AuditAction::ResultCorrected,
            ReviewAction::MarkReviewed { .. } => AuditAction::ResultReviewed,
            ReviewAction::Validate { .. } => AuditAction::ResultValidated,
            ReviewAction::Reject { .. } => AuditAction::ResultRejected,
        }
    }

    pub fn note(&self) -> Option<&str> {
        match self {
            ReviewAction::Correct { note, .. }
            | ReviewAction::MarkReviewed { note }
            | ReviewAction::Validate { note } => note.as_deref(),
            ReviewAction::Reject { reason } => Some(reason),
        }
    }

    /// Audit details recorded with the action.
    pub fn audit_details(&self, from: ReviewState, to: ReviewState) -> serde_json::Value {
        let mut details = serde_json::json!({
            "from": from.as_str(),
            "to": to.as_str(),
        });
        if let ReviewAction::Correct { field, value, .. } = self {
            details["field"] = serde_json::Value::String(field.clone());
            details["value"] = value.clone();
        }
        if let Some(note) = self.note() {
            details["note"] = serde_json::Value::String(note.to_string());
        }
        details
    }
}

/// Compute the state after `action`, rejecting transitions the workflow
/// does not allow.
pub fn next_state(current: ReviewState, action: &ReviewAction) -> Result<ReviewState> {
    use ReviewState::*;
    match (current, action) {
        (Extracted | Reviewed, ReviewAction::Correct { .. }) => Ok(Reviewed),
        (Extracted | Reviewed, ReviewAction::MarkReviewed { .. }) => Ok(Reviewed),
        (Reviewed, ReviewAction::Validate { .. }) => Ok(Validated),
        (Reviewed, ReviewAction::Reject { .. }) => Ok(Rejected),
        (state, action) => Err(PipelineError::InvalidTransition(format!(
            "cannot {} a result in state {}",
            action_name(action),
            state.as_str()
        ))),
    }
}

fn action_name(action: &ReviewAction) -> &'static str {
    match action {
        ReviewAction::Correct { .. } => "correct",
        ReviewAction::MarkReviewed { .. } => "mark reviewed",
        ReviewAction::Validate { .. } => "validate",
        ReviewAction::Reject { .. } => "reject",
    }
}

/// Check that `action` applies to `result` and return the next state.
///
/// Free-text outputs (OCR, summaries) only accept corrections to the fields
/// they expose; structured outputs may gain fields the model missed.
pub fn check_action(result: &StoredResult, action: &ReviewAction) -> Result<ReviewState> {
    if !result.task_type.reviewable() {
        return Err(PipelineError::InvalidTransition(format!(
            "{} results are not reviewable",
            result.task_type
        )));
    }
    if let ReviewAction::Correct { field, .. } = action {
        if field.trim().is_empty() {
            return Err(PipelineError::MalformedInput(
                "correction field must not be empty".to_string(),
            ));
        }
        let open_schema = matches!(
            result.output,
            TaskOutput::Extraction(_) | TaskOutput::FormFill(_)
        );
        if !open_schema && !result.output.field_values().contains_key(field) {
            return Err(PipelineError::MalformedInput(format!(
                "field '{}' is not correctable on {} results",
                field, result.task_type
            )));
        }
    }
    next_state(result.review_state, action)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    Low,
    High,
}

pub fn confidence_band(confidence: Option<f32>, settings: &ReviewSettings) -> Option<ConfidenceBand> {
    confidence.map(|c| {
        if c < settings.confidence_threshold {
            ConfidenceBand::Low
        } else {
            ConfidenceBand::High
        }
    })
}

/// Original output, the human overlay, and the merged view side by side.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveResult {
    #[serde(flatten)]
    pub result: StoredResult,
    pub confidence_band: Option<ConfidenceBand>,
    /// Latest corrected value per field.
    pub overlay: BTreeMap<String, serde_json::Value>,
    /// Original field values with the overlay applied.
    pub effective: BTreeMap<String, serde_json::Value>,
    pub corrections: Vec<Correction>,
}

/// Build the effective view. Corrections apply in id order, so a later
/// correction to the same field wins.
pub fn effective_view(
    result: StoredResult,
    mut corrections: Vec<Correction>,
    settings: &ReviewSettings,
) -> EffectiveResult {
    corrections.sort_by_key(|c| c.id);
    let mut overlay = BTreeMap::new();
    for c in &corrections {
        overlay.insert(c.field.clone(), c.value.clone());
    }
    let mut effective = result.output.field_values();
    for (k, v) in &overlay {
        effective.insert(k.clone(), v.clone());
    }
    EffectiveResult {
        confidence_band: confidence_band(result.confidence, settings),
        result,
        overlay,
        effective,
        corrections,
    }
}

/// Read and review stored results through the effective view.
pub struct Reviews {
    pipeline: Pipeline,
}

impl Reviews {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// `GetResult(tenant, document, task)` with corrections applied.
    pub async fn effective(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
    ) -> Result<EffectiveResult> {
        let store = &self.pipeline.store;
        let result = store
            .get_result(tenant, document, task_type)
            .await?
            .ok_or_else(|| PipelineError::not_found("result", format!("{}/{}", document, task_type)))?;
        let corrections = store.corrections(tenant, document, task_type).await?;
        Ok(effective_view(result, corrections, &self.pipeline.settings.review))
    }

    pub async fn apply(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        task_type: TaskType,
        action: &ReviewAction,
        actor: &UserId,
    ) -> Result<EffectiveResult> {
        let result = self
            .pipeline
            .store
            .apply_review(tenant, document, task_type, action, actor)
            .await?;
        tracing::info!(
            tenant = %tenant,
            document_id = %document,
            task_type = %task_type,
            review_state = result.review_state.as_str(),
            "review applied"
        );
        self.effective(tenant, document, task_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentId, JobId, TaskType, TenantId, UserId};
    use crate::results::{ExtractedField, ExtractionOutput, OcrOutput};
    use chrono::Utc;

    fn extraction_result(confidence: f32) -> StoredResult {
        let fields = BTreeMap::from([(
            "total_amount".to_string(),
            ExtractedField {
                value: serde_json::json!(120.5),
                confidence,
            },
        )]);
        StoredResult {
            tenant_id: TenantId::from("t1"),
            document_id: DocumentId::from("d1"),
            task_type: TaskType::Extraction,
            job_id: JobId::from("j1"),
            output: TaskOutput::Extraction(ExtractionOutput {
                fields,
                average_confidence: confidence,
                model_used: "m".into(),
            }),
            confidence: Some(confidence),
            model_used: Some("m".into()),
            review_state: ReviewState::Extracted,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn correct(field: &str, value: serde_json::Value) -> ReviewAction {
        ReviewAction::Correct {
            field: field.into(),
            value,
            note: None,
        }
    }

    #[test]
    fn validate_requires_review_first() {
        let v = ReviewAction::Validate { note: None };
        assert!(next_state(ReviewState::Extracted, &v).is_err());
        assert_eq!(
            next_state(ReviewState::Reviewed, &v).unwrap(),
            ReviewState::Validated
        );
    }

    #[test]
    fn final_states_reject_further_actions() {
        for state in [ReviewState::Validated, ReviewState::Rejected] {
            let err = next_state(state, &correct("x", 1.into())).unwrap_err();
            assert!(matches!(err, PipelineError::InvalidTransition(_)));
        }
    }

    #[test]
    fn overlay_keeps_original_and_last_correction_wins() {
        let result = extraction_result(0.6);
        let now = Utc::now();
        let corrections = vec![
            Correction {
                id: 2,
                field: "total_amount".into(),
                value: serde_json::json!(130.0),
                corrected_by: UserId::from("u1"),
                note: None,
                created_at: now,
            },
            Correction {
                id: 1,
                field: "total_amount".into(),
                value: serde_json::json!(125.0),
                corrected_by: UserId::from("u1"),
                note: None,
                created_at: now,
            },
        ];
        let view = effective_view(result, corrections, &ReviewSettings::default());
        assert_eq!(view.effective["total_amount"], serde_json::json!(130.0));
        assert_eq!(
            view.result.output.field_values()["total_amount"],
            serde_json::json!(120.5)
        );
        assert_eq!(view.confidence_band, Some(ConfidenceBand::Low));
    }

    #[test]
    fn free_text_results_only_accept_known_fields() {
        let mut result = extraction_result(0.9);
        result.task_type = TaskType::Ocr;
        result.output = TaskOutput::Ocr(OcrOutput {
            text: "hello".into(),
            confidence: 0.9,
            page_count: 1,
            method: "native".into(),
        });
        assert!(check_action(&result, &correct("text", "fixed".into())).is_ok());
        assert!(check_action(&result, &correct("vendor", "x".into())).is_err());
    }

    #[test]
    fn action_deserializes_from_tagged_json() {
        let a: ReviewAction = serde_json::from_value(serde_json::json!({
            "action": "correct", "field": "currency", "value": "EUR"
        }))
        .unwrap();
        assert_eq!(a.audit_action(), AuditAction::ResultCorrected);
        let r: ReviewAction =
            serde_json::from_value(serde_json::json!({"action": "reject", "reason": "wrong vendor"}))
                .unwrap();
        assert_eq!(r.note(), Some("wrong vendor"));
    }

    #[tokio::test]
    async fn reviews_return_the_effective_view() {
        let t = crate::testing::TestPipeline::new();
        let doc = t.upload("t1", "scan.txt", b"raw").await;
        t.commit_ocr(&doc, "Totl 100").await;
        let reviews = t.pipeline.reviews();
        let view = reviews
            .apply(
                &doc.tenant_id,
                &doc.id,
                TaskType::Ocr,
                &correct("text", serde_json::json!("Total 100")),
                &UserId::from("reviewer"),
            )
            .await
            .unwrap();
        assert_eq!(view.result.review_state, ReviewState::Reviewed);
        assert_eq!(view.effective["text"], serde_json::json!("Total 100"));
        assert!(matches!(
            reviews
                .effective(&TenantId::from("t2"), &doc.id, TaskType::Ocr)
                .await
                .unwrap_err(),
            PipelineError::NotFound { .. }
        ));
    }
}
