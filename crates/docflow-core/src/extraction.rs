//! Structured field extraction via the quality generation model.
//!
//! The model is asked for a JSON object keyed by field name, each entry a
//! `{value, confidence}` pair. Responses wrapped in markdown code fences
//! are accepted. Amount-like fields are normalized to numbers whether the
//! document writes `1.234,56` or `1,234.56`.

use std::collections::BTreeMap;

use crate::error::{PipelineError, Result};
use crate::primitives::{GenerationProvider, GenerationRequest, ModelTier};
use crate::results::{average_confidence, ExtractedField, ExtractionOutput};
use crate::summarize::truncate_input;

/// Confidence assumed when the model returns a bare value.
const BARE_VALUE_CONFIDENCE: f32 = 0.5;

const AMOUNT_HINTS: [&str; 5] = ["amount", "total", "subtotal", "price", "tax"];

pub fn build_prompt(text: &str, fields: &[String]) -> String {
    let field_list = fields
        .iter()
        .map(|f| format!("- {}", f))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Extract the following fields from the document.\n\
         Respond with a single JSON object and nothing else. Each key is a field \
         name; each value is an object {{\"value\": <extracted value or null>, \
         \"confidence\": <number between 0 and 1>}}.\n\
         Use null when the field does not appear in the document. Do not guess.\n\n\
         Fields:\n{}\n\n\
         Document:\n{}\n\n\
         JSON:",
        field_list, text
    )
}

/// Parse a model response into the requested fields.
///
/// Keys the model invented are dropped. Fields with a `null` value are
/// treated as missing.
pub fn parse_response(raw: &str, fields: &[String]) -> Result<BTreeMap<String, ExtractedField>> {
    let body = json_body(raw).ok_or_else(|| {
        PipelineError::MalformedInput("extraction response contained no JSON object".to_string())
    })?;
    let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_str(body)?;

    let mut out = BTreeMap::new();
    for name in fields {
        let Some(entry) = parsed.get(name) else {
            continue;
        };
        let (value, confidence) = match entry {
            serde_json::Value::Object(obj) if obj.contains_key("value") => {
                let value = obj.get("value").cloned().unwrap_or_default();
                let confidence = obj
                    .get("confidence")
                    .and_then(|c| c.as_f64())
                    .map(|c| c as f32)
                    .unwrap_or(BARE_VALUE_CONFIDENCE);
                (value, confidence)
            }
            other => (other.clone(), BARE_VALUE_CONFIDENCE),
        };
        if value.is_null() {
            continue;
        }
        let value = if is_amount_field(name) {
            normalize_amount(value)
        } else {
            value
        };
        out.insert(
            name.clone(),
            ExtractedField {
                value,
                confidence: confidence.clamp(0.0, 1.0),
            },
        );
    }
    Ok(out)
}

/// Strip code fences and return the outermost `{...}` span.
fn json_body(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

fn is_amount_field(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    AMOUNT_HINTS.iter().any(|h| lower.contains(h)) && !lower.ends_with("_id")
}

fn normalize_amount(value: serde_json::Value) -> serde_json::Value {
    match &value {
        serde_json::Value::String(s) => parse_amount(s)
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or(value),
        _ => value,
    }
}

/// Parse a money string in either European or US notation.
///
/// ```rust
/// use docflow_core::extraction::parse_amount;
///
/// assert_eq!(parse_amount("€1.234,56"), Some(1234.56));
/// assert_eq!(parse_amount("$1,234.56"), Some(1234.56));
/// assert_eq!(parse_amount("12,5"), Some(12.5));
/// assert_eq!(parse_amount("n/a"), None);
/// ```
pub fn parse_amount(s: &str) -> Option<f64> {
    let negative = s.trim_start().starts_with('-');
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };
    let value: f64 = normalized.parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Run extraction over `text` and return the fields plus the model used.
pub async fn extract_fields(
    generator: &dyn GenerationProvider,
    text: &str,
    fields: &[String],
    max_input_chars: usize,
) -> Result<(BTreeMap<String, ExtractedField>, String)> {
    if fields.is_empty() {
        return Err(PipelineError::Config(
            "no extraction fields configured".to_string(),
        ));
    }
    let input = truncate_input(text, max_input_chars);
    let generation = generator
        .generate(&GenerationRequest::new(
            build_prompt(&input, fields),
            ModelTier::Quality,
        ))
        .await?;
    let parsed = parse_response(&generation.text, fields)?;
    tracing::debug!(
        requested = fields.len(),
        extracted = parsed.len(),
        model = %generation.model,
        "fields extracted"
    );
    Ok((parsed, generation.model))
}

pub async fn extract(
    generator: &dyn GenerationProvider,
    text: &str,
    fields: &[String],
    max_input_chars: usize,
) -> Result<ExtractionOutput> {
    let (fields, model_used) = extract_fields(generator, text, fields, max_input_chars).await?;
    Ok(ExtractionOutput {
        average_confidence: average_confidence(&fields),
        fields,
        model_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedGenerator;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_fenced_json_and_drops_unrequested_keys() {
        let raw = "```json\n{\"vendor_name\": {\"value\": \"ACME\", \"confidence\": 0.9},\
                   \"total_amount\": {\"value\": \"1.234,56 EUR\", \"confidence\": 1.4},\
                   \"due_date\": {\"value\": null, \"confidence\": 0.1},\
                   \"hallucinated\": 1}\n```";
        let fields = parse_response(raw, &names(&["vendor_name", "total_amount", "due_date"])).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["vendor_name"].value, "ACME");
        assert_eq!(fields["total_amount"].value, serde_json::json!(1234.56));
        assert_eq!(fields["total_amount"].confidence, 1.0);
        assert!(!fields.contains_key("hallucinated"));
    }

    #[test]
    fn bare_values_get_default_confidence() {
        let fields = parse_response("{\"currency\": \"EUR\"}", &names(&["currency"])).unwrap();
        assert_eq!(fields["currency"].confidence, BARE_VALUE_CONFIDENCE);
    }

    #[test]
    fn non_json_response_is_malformed() {
        let err = parse_response("I could not find anything.", &names(&["x"])).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedInput(_)));
    }

    #[test]
    fn amount_parsing_handles_both_notations() {
        assert_eq!(parse_amount("1,234.56"), Some(1234.56));
        assert_eq!(parse_amount("1.234,56"), Some(1234.56));
        assert_eq!(parse_amount("-42"), Some(-42.0));
        assert_eq!(parse_amount(""), None);
        assert!(!is_amount_field("vendor_tax_id"));
        assert!(is_amount_field("tax_amount"));
    }

    #[tokio::test]
    async fn extract_uses_quality_model() {
        let gen = ScriptedGenerator::replying(
            r#"{"invoice_number": {"value": "INV-7", "confidence": 0.8}, "total_amount": {"value": 10, "confidence": 0.6}}"#,
        );
        let out = extract(&gen, "Invoice INV-7 total 10", &names(&["invoice_number", "total_amount"]), 1000)
            .await
            .unwrap();
        assert_eq!(out.model_used, "quality-test");
        assert!((out.average_confidence - 0.7).abs() < 1e-6);
    }
}
