//! Embedding backends.
//!
//! Every backend declares its model and dimensionality up front; the
//! pair is the [`EmbeddingVersion`](docflow_core::embedding::EmbeddingVersion)
//! stamped on stored chunks, so changing either one means re-indexing.

use anyhow::{bail, Result};
use async_trait::async_trait;

use docflow_core::embedding::EmbeddingProvider;
use docflow_core::PipelineError;

use super::{http_client, openai_api_key, JsonPost};
use crate::config::EmbeddingConfig;

const OPENAI_URL: &str = "https://api.openai.com/v1";
const OLLAMA_URL: &str = "http://localhost:11434";

pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbedder)),
        "openai" => Ok(Box::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Box::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("local embedding provider requires --features local-embeddings"),
        other => bail!("unknown embedding provider: {}", other),
    }
}

fn required_model(config: &EmbeddingConfig, backend: &str) -> Result<(String, usize)> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for {} provider", backend))?;
    let dims = config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required for {} provider", backend))?;
    Ok((model, dims))
}

// ============ Disabled ============

/// Fails every call. Indexing jobs dead-letter with a configuration error
/// and queries are refused until a real provider is configured.
pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingProvider for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> docflow_core::Result<Vec<Vec<f32>>> {
        Err(PipelineError::Config(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI ============

/// `POST {url}/embeddings`. Requires `OPENAI_API_KEY`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required_model(config, "OpenAI")?;
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key: openai_api_key()?,
            url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
            model,
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> docflow_core::Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = JsonPost {
            client: &self.client,
            url: format!("{}/embeddings", self.url.trim_end_matches('/')),
            bearer: Some(&self.api_key),
            body: &body,
            max_retries: self.max_retries,
            service: "OpenAI",
        }
        .send()
        .await?;
        parse_openai_response(&json)
    }
}

/// Extracts `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> docflow_core::Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| bad_response("OpenAI", "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| bad_response("OpenAI", "missing embedding"))?;
        indexed.push((index, to_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// `POST {url}/api/embed` on a local Ollama instance.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required_model(config, "Ollama")?;
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: config.url.clone().unwrap_or_else(|| OLLAMA_URL.to_string()),
            model,
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> docflow_core::Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = JsonPost {
            client: &self.client,
            url: format!("{}/api/embed", self.url.trim_end_matches('/')),
            bearer: None,
            body: &body,
            max_retries: self.max_retries,
            service: "Ollama",
        }
        .send()
        .await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> docflow_core::Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| bad_response("Ollama", "missing embeddings array"))?
        .iter()
        .map(|v| to_vector(v, "Ollama"))
        .collect()
}

fn to_vector(value: &serde_json::Value, service: &str) -> docflow_core::Result<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| bad_response(service, "embedding is not an array"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| bad_response(service, "embedding holds a non-number"))
        })
        .collect()
}

fn bad_response(service: &str, what: &str) -> PipelineError {
    PipelineError::TransientIo(format!("invalid {} response: {}", service, what))
}

// ============ Local (fastembed) ============

/// In-process inference via fastembed. The model is downloaded on first
/// use and kept loaded for the life of the process.
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model_name: String,
    model: fastembed::EmbeddingModel,
    dims: usize,
    batch_size: usize,
    loaded: std::sync::Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (model, default_dims) = fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            model,
            dims: config.dims.unwrap_or(default_dims),
            batch_size: config.batch_size,
            loaded: Default::default(),
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn fastembed_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    use fastembed::EmbeddingModel as M;
    match name {
        "all-minilm-l6-v2" => Ok((M::AllMiniLML6V2, 384)),
        "bge-small-en-v1.5" => Ok((M::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((M::BGEBaseENV15, 768)),
        "bge-large-en-v1.5" => Ok((M::BGELargeENV15, 1024)),
        "nomic-embed-text-v1.5" => Ok((M::NomicEmbedTextV15, 768)),
        "multilingual-e5-small" => Ok((M::MultilingualE5Small, 384)),
        "multilingual-e5-base" => Ok((M::MultilingualE5Base, 768)),
        other => bail!(
            "unknown local embedding model '{}'; supported: all-minilm-l6-v2, bge-small-en-v1.5, \
             bge-base-en-v1.5, bge-large-en-v1.5, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> docflow_core::Result<Vec<Vec<f32>>> {
        let loaded = self.loaded.clone();
        let model = self.model.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = loaded.lock().map_err(|_| {
                PipelineError::TransientIo("local embedding model lock poisoned".to_string())
            })?;
            if guard.is_none() {
                let init = fastembed::InitOptions::new(model).with_show_download_progress(false);
                let embedding = fastembed::TextEmbedding::try_new(init).map_err(|e| {
                    PipelineError::Config(format!("failed to load local embedding model: {}", e))
                })?;
                *guard = Some(embedding);
            }
            let embedding = guard.as_mut().ok_or_else(|| {
                PipelineError::TransientIo("local embedding model not loaded".to_string())
            })?;
            embedding
                .embed(texts, Some(batch_size))
                .map_err(|e| PipelineError::TransientIo(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| PipelineError::TransientIo(format!("embedding task panicked: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn openai_response_is_ordered_by_index() {
        let body = json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        let vectors = parse_openai_response(&body).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn malformed_responses_are_transient() {
        assert!(matches!(
            parse_openai_response(&json!({"object": "error"})).unwrap_err(),
            PipelineError::TransientIo(_)
        ));
        assert!(parse_ollama_response(&json!({"embeddings": [["x"]]})).is_err());
        let ok = parse_ollama_response(&json!({"embeddings": [[0.5, 0.25]]})).unwrap();
        assert_eq!(ok, vec![vec![0.5, 0.25]]);
    }

    #[tokio::test]
    async fn disabled_embedder_is_a_config_error() {
        let embedder = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(embedder.model_name(), "disabled");
        let err = embedder.embed(&["hello".to_string()]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn remote_providers_need_model_and_dims() {
        let config = EmbeddingConfig {
            provider: "ollama".to_string(),
            ..Default::default()
        };
        assert!(create_embedder(&config).is_err());
        let config = EmbeddingConfig {
            provider: "ollama".to_string(),
            model: Some("nomic-embed-text".to_string()),
            dims: Some(768),
            ..Default::default()
        };
        let embedder = create_embedder(&config).unwrap();
        assert_eq!(embedder.version().to_string(), "nomic-embed-text/768");
    }
}
