//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, the [`EmbeddingVersion`] stamped on every stored chunk, and
//! pure helpers for vector serialization and similarity.
//!
//! Concrete providers (OpenAI, Ollama, fastembed) live in the `docflow` app
//! crate.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Identifies the vector space a vector lives in. Vectors from different
/// versions are never compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbeddingVersion {
    pub model: String,
    pub dims: usize,
}

impl EmbeddingVersion {
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
        }
    }

    /// Fails unless `other` is the same version.
    pub fn ensure_matches(&self, other: &EmbeddingVersion) -> Result<()> {
        if self != other {
            return Err(PipelineError::EmbeddingVersionMismatch {
                expected: self.to_string(),
                found: other.to_string(),
            });
        }
        Ok(())
    }

    /// Fails unless `vector` has this version's dimensionality.
    pub fn ensure_dims(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dims {
            return Err(PipelineError::EmbeddingVersionMismatch {
                expected: self.to_string(),
                found: format!("{}/{}", self.model, vector.len()),
            });
        }
        Ok(())
    }
}

impl fmt::Display for EmbeddingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.dims)
    }
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn version(&self) -> EmbeddingVersion {
        EmbeddingVersion::new(self.model_name(), self.dims())
    }
}

/// Embed a single text and check its dimensionality.
pub async fn embed_one(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let mut out = provider.embed(&[text.to_string()]).await?;
    let vector = out
        .pop()
        .ok_or_else(|| PipelineError::TransientIo("empty embedding response".to_string()))?;
    provider.version().ensure_dims(&vector)?;
    Ok(vector)
}

/// Embed `texts` in batches of `batch_size`, checking every vector's
/// dimensionality against the provider's declared version.
pub async fn embed_batched(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let version = provider.version();
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let out = provider.embed(batch).await?;
        if out.len() != batch.len() {
            return Err(PipelineError::TransientIo(format!(
                "embedding provider returned {} vectors for {} inputs",
                out.len(),
                batch.len()
            )));
        }
        for v in &out {
            version.ensure_dims(v)?;
        }
        vectors.extend(out);
    }
    Ok(vectors)
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use docflow_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors. Callers
/// must check [`EmbeddingVersion`] first; a length mismatch here is a bug,
/// and also yields `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let a = EmbeddingVersion::new("text-embedding-3-small", 1536);
        let b = EmbeddingVersion::new("nomic-embed-text", 768);
        assert!(a.ensure_matches(&a.clone()).is_ok());
        let err = a.ensure_matches(&b).unwrap_err();
        assert!(matches!(err, PipelineError::EmbeddingVersionMismatch { .. }));
        assert!(a.ensure_dims(&[0.0; 768]).is_err());
    }
}
