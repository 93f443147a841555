//! Document summarization on top of the generation primitive.
//!
//! Long or number-heavy documents go to the quality model when the caller
//! asks for `auto`; everything else uses the fast model. Input longer than
//! the configured limit is truncated with a visible marker so the model
//! knows it saw a prefix.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::primitives::{GenerationProvider, GenerationRequest, ModelTier};
use crate::results::{SummaryOutput, SummaryType};

const QUALITY_WORD_THRESHOLD: usize = 10_000;
const QUALITY_NUMBER_THRESHOLD: usize = 100;
const MAX_KEY_POINTS: usize = 10;
const FALLBACK_KEY_POINTS: usize = 5;

pub const TRUNCATION_MARKER: &str = "\n\n[Document truncated for processing]";

/// Which model the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPreference {
    Fast,
    Quality,
    #[default]
    Auto,
}

impl ModelPreference {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fast" => Ok(ModelPreference::Fast),
            "quality" => Ok(ModelPreference::Quality),
            "auto" => Ok(ModelPreference::Auto),
            other => Err(PipelineError::MalformedInput(format!(
                "unknown model preference '{}'",
                other
            ))),
        }
    }
}

impl SummaryType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "concise" => Ok(SummaryType::Concise),
            "detailed" => Ok(SummaryType::Detailed),
            other => Err(PipelineError::MalformedInput(format!(
                "unknown summary type '{}'",
                other
            ))),
        }
    }
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Pick the model tier for `text`.
pub fn select_tier(text: &str, preference: ModelPreference) -> ModelTier {
    match preference {
        ModelPreference::Fast => ModelTier::Fast,
        ModelPreference::Quality => ModelTier::Quality,
        ModelPreference::Auto => {
            if word_count(text) > QUALITY_WORD_THRESHOLD
                || has_table_markup(text)
                || count_numbers(text) > QUALITY_NUMBER_THRESHOLD
            {
                ModelTier::Quality
            } else {
                ModelTier::Fast
            }
        }
    }
}

/// A `| word |` cell: pipe, whitespace, a word, whitespace, pipe.
fn has_table_markup(text: &str) -> bool {
    text.lines().any(|line| {
        let cells: Vec<&str> = line.split('|').collect();
        cells.len() >= 3
            && cells[1..cells.len() - 1].iter().any(|cell| {
                cell.starts_with(char::is_whitespace)
                    && cell.ends_with(char::is_whitespace)
                    && !cell.trim().is_empty()
            })
    })
}

/// Maximal runs of ASCII digits.
fn count_numbers(text: &str) -> usize {
    let mut count = 0;
    let mut in_number = false;
    for c in text.chars() {
        let digit = c.is_ascii_digit();
        if digit && !in_number {
            count += 1;
        }
        in_number = digit;
    }
    count
}

/// Cut `text` to at most `max_chars` characters, appending
/// [`TRUNCATION_MARKER`] when anything was dropped.
pub fn truncate_input(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{}", &text[..cut], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

pub fn build_prompt(text: &str, summary_type: SummaryType) -> String {
    match summary_type {
        SummaryType::Concise => format!(
            "Summarize the following document in 3-5 concise bullet points.\n\
             Focus on the main ideas, key findings, and important takeaways.\n\
             Use clear, professional language.\n\n\
             Document:\n{}\n\n\
             Summary (3-5 bullet points):",
            text
        ),
        SummaryType::Detailed => format!(
            "Provide a comprehensive summary of the following document.\n\n\
             Include:\n\
             1. Main topic and purpose (1-2 sentences)\n\
             2. Key points and findings (5-7 bullet points)\n\
             3. Important details, data, or conclusions (3-4 bullet points)\n\
             4. Overall significance or implications (1-2 sentences)\n\n\
             Use clear, professional language suitable for business use.\n\n\
             Document:\n{}\n\n\
             Detailed Summary:",
            text
        ),
    }
}

/// Pull bullet and numbered lines out of a generated summary.
///
/// Falls back to the first sentences longer than 20 characters when the
/// model answered in prose.
pub fn extract_key_points(summary: &str) -> Vec<String> {
    let mut points: Vec<String> = summary
        .lines()
        .filter_map(|line| bullet_body(line.trim()))
        .map(|body| strip_emphasis(body.trim()))
        .filter(|p| !p.is_empty())
        .collect();

    if points.is_empty() {
        points = summary
            .split(|c| matches!(c, '.' | '!' | '?'))
            .map(str::trim)
            .filter(|s| s.chars().count() > 20)
            .take(FALLBACK_KEY_POINTS)
            .map(str::to_string)
            .collect();
    }
    points.truncate(MAX_KEY_POINTS);
    points
}

fn bullet_body(line: &str) -> Option<&str> {
    for marker in ["- ", "• ", "* "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return Some(rest);
        }
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        return line[digits..].strip_prefix(". ");
    }
    None
}

/// Remove `**bold**` and `*italic*` markers.
fn strip_emphasis(s: &str) -> String {
    s.replace("**", "").replace('*', "")
}

/// Summarize `text` and derive key points and compression stats.
pub async fn summarize(
    generator: &dyn GenerationProvider,
    text: &str,
    summary_type: SummaryType,
    preference: ModelPreference,
    max_input_chars: usize,
) -> Result<SummaryOutput> {
    if text.trim().is_empty() {
        return Err(PipelineError::MalformedInput(
            "document has no text to summarize".to_string(),
        ));
    }
    let tier = select_tier(text, preference);
    let input = truncate_input(text, max_input_chars);
    let generation = generator
        .generate(&GenerationRequest::new(build_prompt(&input, summary_type), tier))
        .await?;

    let summary = generation.text.trim().to_string();
    let original_word_count = word_count(text);
    let summary_words = word_count(&summary);
    Ok(SummaryOutput {
        key_points: extract_key_points(&summary),
        summary,
        summary_type,
        word_count: summary_words,
        original_word_count,
        compression_ratio: if original_word_count == 0 {
            0.0
        } else {
            summary_words as f32 / original_word_count as f32
        },
        model_used: generation.model,
    })
}
