//! Retrieval-augmented question answering over a tenant's indexed chunks.
//!
//! # Query Flow
//!
//! 1. Validate the request and resolve `top_k` (default 5, capped).
//! 2. Refuse to run when the question would be embedded with a different
//!    [`EmbeddingVersion`](crate::embedding::EmbeddingVersion) than the
//!    chunks in scope.
//! 3. Embed the question and run a tenant-filtered cosine search.
//! 4. Re-check every returned row's tenant. A foreign row is an
//!    `IsolationViolation`, never a silently dropped result.
//! 5. Keep chunks scoring at least `min_relevance`. If none qualify, return
//!    `insufficient_context` without calling the generator.
//! 6. Generate an answer from the numbered context blocks and return it
//!    with exactly those chunks as sources.

use serde::{Deserialize, Serialize};

use crate::embedding::embed_one;
use crate::error::{PipelineError, Result};
use crate::models::{DocumentId, ScoredChunk, TenantId};
use crate::pipeline::Pipeline;
use crate::primitives::{GenerationRequest, ModelTier};
use crate::store::VectorQuery;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub tenant_id: TenantId,
    pub question: String,
    #[serde(default)]
    pub document_ids: Option<Vec<DocumentId>>,
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Embedding model the caller expects; rejected when it differs from
    /// the configured embedder.
    #[serde(default)]
    pub embedding_model: Option<String>,
}

impl QueryRequest {
    pub fn new(tenant_id: TenantId, question: impl Into<String>) -> Self {
        Self {
            tenant_id,
            question: question.into(),
            document_ids: None,
            top_k: None,
            embedding_model: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Answered,
    InsufficientContext,
}

/// Pointer to a chunk the answer was generated from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub document_id: DocumentId,
    pub chunk_index: i64,
    pub chunk_id: String,
    pub score: f32,
}

impl From<&ScoredChunk> for Source {
    fn from(c: &ScoredChunk) -> Self {
        Self {
            document_id: c.document_id.clone(),
            chunk_index: c.chunk_index,
            chunk_id: c.chunk_id.clone(),
            score: c.score,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: QueryStatus,
    pub answer: Option<String>,
    pub sources: Vec<Source>,
    pub model_used: Option<String>,
    pub embedding_model: String,
}

pub struct QueryEngine {
    pipeline: Pipeline,
}

impl QueryEngine {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let tenant = &request.tenant_id;
        tenant.require()?;
        let question = request.question.trim();
        if question.is_empty() {
            return Err(PipelineError::MalformedInput(
                "question must not be empty".to_string(),
            ));
        }
        let params = &self.pipeline.settings.retrieval;
        let top_k = request
            .top_k
            .unwrap_or(params.default_top_k)
            .clamp(1, params.max_top_k.max(1));
        let scope = request.document_ids.as_deref();

        let embedder = self.pipeline.primitives.embedder.as_ref();
        let version = embedder.version();
        if let Some(model) = &request.embedding_model {
            if model != &version.model {
                return Err(PipelineError::EmbeddingVersionMismatch {
                    expected: version.to_string(),
                    found: model.clone(),
                });
            }
        }
        for indexed in self.pipeline.store.embedding_versions(tenant, scope).await? {
            version.ensure_matches(&indexed)?;
        }

        let vector = embed_one(embedder, question).await?;
        let hits = self
            .pipeline
            .store
            .vector_search(&VectorQuery {
                tenant_id: tenant,
                vector: &vector,
                version: &version,
                document_ids: scope,
                limit: top_k,
            })
            .await?;

        for hit in &hits {
            if &hit.tenant_id != tenant {
                return Err(PipelineError::IsolationViolation(format!(
                    "search for tenant {} returned chunk {} of tenant {}",
                    tenant, hit.chunk_id, hit.tenant_id
                )));
            }
            if scope.is_some_and(|ids| !ids.contains(&hit.document_id)) {
                return Err(PipelineError::IsolationViolation(format!(
                    "search returned chunk {} outside the requested documents",
                    hit.chunk_id
                )));
            }
        }

        let context: Vec<&ScoredChunk> = hits
            .iter()
            .filter(|h| h.score >= params.min_relevance)
            .collect();
        tracing::info!(
            tenant = %tenant,
            candidates = hits.len(),
            relevant = context.len(),
            top_k,
            "retrieval"
        );

        if context.is_empty() {
            return Ok(QueryResponse {
                status: QueryStatus::InsufficientContext,
                answer: None,
                sources: Vec::new(),
                model_used: None,
                embedding_model: version.model,
            });
        }

        let generation = self
            .pipeline
            .primitives
            .generator
            .generate(&GenerationRequest::new(
                build_prompt(question, &context),
                ModelTier::Fast,
            ))
            .await?;

        Ok(QueryResponse {
            status: QueryStatus::Answered,
            answer: Some(generation.text.trim().to_string()),
            sources: context.iter().map(|c| Source::from(*c)).collect(),
            model_used: Some(generation.model),
            embedding_model: version.model,
        })
    }
}

/// Grounded-answer prompt with numbered context blocks.
pub fn build_prompt(question: &str, context: &[&ScoredChunk]) -> String {
    let mut prompt = String::from(
        "Answer the question using only the context below. If the context does \
         not contain the answer, say that you do not know. Cite the context \
         blocks you used by their number, e.g. [1].\n\n",
    );
    for (i, chunk) in context.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] (document {}, chunk {})\n{}\n\n",
            i + 1,
            chunk.document_id,
            chunk.chunk_index,
            chunk.text
        ));
    }
    prompt.push_str(&format!("Question: {}\nAnswer:", question));
    prompt
}
