//! External AI capabilities invoked by workers.
//!
//! Each primitive is a trait object so workers, tests, and the HTTP server
//! can swap implementations. Implementations report failures through
//! [`PipelineError`](crate::PipelineError) variants so the worker can
//! classify them; they never decide about retries at the queue level.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingProvider;
use crate::error::Result;

/// Which generation model a call should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    Quality,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub tier: ModelTier,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, tier: ModelTier) -> Self {
        Self {
            prompt: prompt.into(),
            tier,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Concrete model identifier that produced `text`.
    pub model: String,
}

/// Text generation (summaries, field extraction, grounded answers).
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model_for(&self, tier: ModelTier) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation>;
}

/// Text recognized from a blob.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedText {
    pub text: String,
    /// Quality signal in `[0, 1]`.
    pub confidence: f32,
    pub page_count: u32,
    pub method: String,
}

/// OCR / text extraction over raw blob bytes.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    fn method(&self) -> &str;

    /// Fails with `MalformedInput` for unreadable bytes or unsupported
    /// mime types.
    async fn recognize(&self, bytes: &[u8], mime_type: &str) -> Result<RecognizedText>;
}

/// The set of primitives a worker or query engine is wired with.
#[derive(Clone)]
pub struct Primitives {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub generator: Arc<dyn GenerationProvider>,
    pub ocr: Arc<dyn OcrProvider>,
}
