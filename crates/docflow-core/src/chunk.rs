//! Overlapping, boundary-aware text chunker.
//!
//! Splits extracted document text into [`TextChunk`]s no longer than
//! `max_tokens` (converted to characters at 4 chars/token), with up to
//! `overlap_tokens` of trailing context repeated at the start of the next
//! chunk.
//!
//! # Algorithm
//!
//! 1. Recursively break the text into atomic spans no longer than
//!    `max_chars`, trying separators in order: paragraph (`\n\n`), line
//!    (`\n`), sentence (`. `), word (` `). A span with none of them is hard
//!    split on a UTF-8 char boundary. Separators stay attached to the span
//!    before them, so spans are contiguous byte ranges of the input.
//! 2. Greedily merge spans into a window until the next span would exceed
//!    `max_chars`; emit the window, then drop spans from its front until
//!    what remains fits in `overlap_chars`.
//! 3. Trim each emitted chunk; whitespace-only chunks are dropped.
//!
//! Unlike the paragraph chunker this grew out of, empty input produces
//! **zero** chunks. Indexing records that case as `indexed = true` with
//! `chunk_count = 0`.
//!
//! # Example
//!
//! ```rust
//! use docflow_core::chunk::chunk_text;
//! use docflow_core::settings::ChunkParams;
//!
//! let params = ChunkParams { max_tokens: 250, overlap_tokens: 50 };
//! let chunks = chunk_text("Hello world.\n\nSecond paragraph.", &params);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].chunk_index, 0);
//! assert!(chunk_text("  \n\n ", &params).is_empty());
//! ```

use std::collections::VecDeque;
use std::ops::Range;

use sha2::{Digest, Sha256};

use crate::settings::ChunkParams;

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// Page break marker emitted by text extractors between pages.
pub const PAGE_BREAK: char = '\u{0C}';

/// A chunk of text before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    pub token_count: usize,
    /// 1-based page the chunk starts on, when the text has page breaks.
    pub page_number: Option<u32>,
}

/// Estimated token count at [`CHARS_PER_TOKEN`].
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split `text` into overlapping chunks with contiguous indices from 0.
pub fn chunk_text(text: &str, params: &ChunkParams) -> Vec<TextChunk> {
    let max_chars = params.max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = (params.overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut spans = Vec::new();
    split_spans(text, 0, max_chars, &SEPARATORS, &mut spans);

    let has_pages = text.contains(PAGE_BREAK);
    let mut chunks = Vec::new();
    let mut emit = |range: Range<usize>| {
        let piece = text[range.clone()].trim();
        if piece.is_empty() {
            return;
        }
        let page_number = if has_pages {
            Some(text[..range.start].matches(PAGE_BREAK).count() as u32 + 1)
        } else {
            None
        };
        chunks.push(make_chunk(chunks.len() as i64, piece, page_number));
    };

    let mut window: VecDeque<Range<usize>> = VecDeque::new();
    let mut total = 0usize;
    for span in spans {
        let len = span.len();
        if total + len > max_chars && !window.is_empty() {
            if let (Some(first), Some(last)) = (window.front(), window.back()) {
                emit(first.start..last.end);
            }
            while total > overlap_chars || (total + len > max_chars && total > 0) {
                match window.pop_front() {
                    Some(dropped) => total -= dropped.len(),
                    None => break,
                }
            }
        }
        total += len;
        window.push_back(span);
    }
    if let (Some(first), Some(last)) = (window.front(), window.back()) {
        emit(first.start..last.end);
    }

    chunks
}

/// Stable chunk identifier derived from the document, index, and content.
///
/// Re-running the same indexing job produces the same ids.
pub fn chunk_id(document_id: &str, chunk: &TextChunk) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(b":");
    hasher.update(chunk.chunk_index.to_le_bytes());
    hasher.update(b":");
    hasher.update(chunk.hash.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

fn split_spans(
    text: &str,
    offset: usize,
    max_chars: usize,
    separators: &[&str],
    out: &mut Vec<Range<usize>>,
) {
    if text.is_empty() {
        return;
    }
    if text.len() <= max_chars {
        out.push(offset..offset + text.len());
        return;
    }

    let Some(pos) = separators.iter().position(|sep| text.contains(sep)) else {
        hard_split(text, offset, max_chars, out);
        return;
    };
    let sep = separators[pos];
    let rest = &separators[pos + 1..];

    let mut start = 0;
    for (idx, _) in text.match_indices(sep) {
        let end = idx + sep.len();
        if end <= start {
            continue;
        }
        split_spans(&text[start..end], offset + start, max_chars, rest, out);
        start = end;
    }
    if start < text.len() {
        split_spans(&text[start..], offset + start, max_chars, rest, out);
    }
}

fn hard_split(text: &str, offset: usize, max_chars: usize, out: &mut Vec<Range<usize>>) {
    let mut start = 0;
    while start < text.len() {
        let remaining = &text[start..];
        let mut cut = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        if cut == 0 {
            cut = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        out.push(offset + start..offset + start + cut);
        start += cut;
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn make_chunk(index: i64, text: &str, page_number: Option<u32>) -> TextChunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    TextChunk {
        chunk_index: index,
        text: text.to_string(),
        hash,
        token_count: estimate_tokens(text),
        page_number,
    }
}
