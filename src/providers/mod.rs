//! Concrete AI primitives: embedding backends, text generation backends,
//! and native text recognition.
//!
//! Use [`create_primitives`] to build the set a worker or the query
//! engine is wired with:
//!
//! | `[embedding].provider` | Backend |
//! |------------------------|---------|
//! | `"disabled"` | [`embedding::DisabledEmbedder`] |
//! | `"openai"` | [`embedding::OpenAiEmbedder`] |
//! | `"ollama"` | [`embedding::OllamaEmbedder`] |
//! | `"local"` | `embedding::LocalEmbedder` (feature `local-embeddings`) |
//!
//! Generation follows the same pattern with `[generation].provider`.
//!
//! # Retry Strategy
//!
//! HTTP backends retry inside a single call before reporting to the
//! worker, which then applies queue-level backoff:
//! - HTTP 429 → retry; once retries run out, [`PipelineError::QuotaExceeded`]
//! - HTTP 5xx and network errors → retry; then [`PipelineError::TransientIo`]
//! - other HTTP 4xx → fail immediately with [`PipelineError::Rejected`]
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

pub mod embedding;
pub mod generation;
pub mod ocr;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use docflow_core::primitives::Primitives;
use docflow_core::PipelineError;

use crate::config::Config;

pub fn create_primitives(config: &Config) -> Result<Primitives> {
    Ok(Primitives {
        embedder: Arc::from(embedding::create_embedder(&config.embedding)?),
        generator: Arc::from(generation::create_generator(&config.generation)?),
        ocr: Arc::new(ocr::NativeTextOcr::new()),
    })
}

/// Reads `OPENAI_API_KEY`, failing at wiring time instead of on the first
/// job.
fn openai_api_key() -> Result<String> {
    std::env::var("OPENAI_API_KEY")
        .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// A JSON POST to an HTTP backend, retried per the module-level strategy.
pub(crate) struct JsonPost<'a> {
    pub client: &'a reqwest::Client,
    pub url: String,
    pub bearer: Option<&'a str>,
    pub body: &'a serde_json::Value,
    pub max_retries: u32,
    /// Backend name used in error messages, e.g. `"OpenAI"`.
    pub service: &'static str,
}

impl JsonPost<'_> {
    pub async fn send(&self) -> docflow_core::Result<serde_json::Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(&self.url).json(self.body);
            if let Some(key) = self.bearer {
                request = request.bearer_auth(key);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(service = self.service, attempt, error = %e, "request failed");
                    last_err = Some(PipelineError::TransientIo(format!(
                        "{} connection error ({}): {}",
                        self.service, self.url, e
                    )));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return response.json().await.map_err(|e| {
                    PipelineError::TransientIo(format!(
                        "{} returned an unreadable body: {}",
                        self.service, e
                    ))
                });
            }

            let body_text = response.text().await.unwrap_or_default();
            let message = format!("{} API error {}: {}", self.service, status, body_text);
            if status.as_u16() == 429 {
                last_err = Some(PipelineError::QuotaExceeded(message));
                continue;
            }
            if status.is_server_error() {
                last_err = Some(PipelineError::TransientIo(message));
                continue;
            }
            return Err(PipelineError::Rejected(message));
        }

        Err(last_err.unwrap_or_else(|| {
            PipelineError::TransientIo(format!("{} request failed after retries", self.service))
        }))
    }
}
