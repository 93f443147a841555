//! Text generation backends.
//!
//! Each backend maps [`ModelTier::Fast`] and [`ModelTier::Quality`] onto
//! concrete model names; `quality_model` falls back to `fast_model` when
//! only one is configured.

use anyhow::{bail, Result};
use async_trait::async_trait;

use docflow_core::primitives::{Generation, GenerationProvider, GenerationRequest, ModelTier};
use docflow_core::PipelineError;

use super::{http_client, openai_api_key, JsonPost};
use crate::config::GenerationConfig;

const OPENAI_URL: &str = "https://api.openai.com/v1";
const OLLAMA_URL: &str = "http://localhost:11434";

pub fn create_generator(config: &GenerationConfig) -> Result<Box<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledGenerator)),
        "openai" => Ok(Box::new(OpenAiGenerator::new(config)?)),
        "ollama" => Ok(Box::new(OllamaGenerator::new(config)?)),
        other => bail!("unknown generation provider: {}", other),
    }
}

/// Fast and quality model names.
#[derive(Debug, Clone)]
struct Models {
    fast: String,
    quality: String,
}

impl Models {
    fn from_config(config: &GenerationConfig) -> Result<Self> {
        let fast = config.fast_model.clone().ok_or_else(|| {
            anyhow::anyhow!("generation.fast_model required for {} provider", config.provider)
        })?;
        let quality = config.quality_model.clone().unwrap_or_else(|| fast.clone());
        Ok(Self { fast, quality })
    }

    fn for_tier(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast,
            ModelTier::Quality => &self.quality,
        }
    }
}

pub struct DisabledGenerator;

#[async_trait]
impl GenerationProvider for DisabledGenerator {
    fn model_for(&self, _tier: ModelTier) -> &str {
        "disabled"
    }

    async fn generate(&self, _request: &GenerationRequest) -> docflow_core::Result<Generation> {
        Err(PipelineError::Config(
            "generation provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI ============

/// `POST {url}/chat/completions` with a single user message.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_key: String,
    url: String,
    models: Models,
    temperature: f32,
    max_output_tokens: u32,
    max_retries: u32,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key: openai_api_key()?,
            url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
            models: Models::from_config(config)?,
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAiGenerator {
    fn model_for(&self, tier: ModelTier) -> &str {
        self.models.for_tier(tier)
    }

    async fn generate(&self, request: &GenerationRequest) -> docflow_core::Result<Generation> {
        let model = self.models.for_tier(request.tier);
        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": self.temperature,
            "max_tokens": self.max_output_tokens,
        });
        let json = JsonPost {
            client: &self.client,
            url: format!("{}/chat/completions", self.url.trim_end_matches('/')),
            bearer: Some(&self.api_key),
            body: &body,
            max_retries: self.max_retries,
            service: "OpenAI",
        }
        .send()
        .await?;
        parse_chat_response(&json, model)
    }
}

fn parse_chat_response(json: &serde_json::Value, requested: &str) -> docflow_core::Result<Generation> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            PipelineError::TransientIo("invalid OpenAI response: missing message content".into())
        })?;
    let model = json
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or(requested);
    Ok(Generation {
        text: text.to_string(),
        model: model.to_string(),
    })
}

// ============ Ollama ============

/// `POST {url}/api/generate` with streaming off.
pub struct OllamaGenerator {
    client: reqwest::Client,
    url: String,
    models: Models,
    temperature: f32,
    max_output_tokens: u32,
    max_retries: u32,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: config.url.clone().unwrap_or_else(|| OLLAMA_URL.to_string()),
            models: Models::from_config(config)?,
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaGenerator {
    fn model_for(&self, tier: ModelTier) -> &str {
        self.models.for_tier(tier)
    }

    async fn generate(&self, request: &GenerationRequest) -> docflow_core::Result<Generation> {
        let model = self.models.for_tier(request.tier);
        let body = serde_json::json!({
            "model": model,
            "prompt": request.prompt,
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_output_tokens,
            },
        });
        let json = JsonPost {
            client: &self.client,
            url: format!("{}/api/generate", self.url.trim_end_matches('/')),
            bearer: None,
            body: &body,
            max_retries: self.max_retries,
            service: "Ollama",
        }
        .send()
        .await?;
        let text = json
            .get("response")
            .and_then(|r| r.as_str())
            .ok_or_else(|| {
                PipelineError::TransientIo("invalid Ollama response: missing response".into())
            })?;
        Ok(Generation {
            text: text.to_string(),
            model: model.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quality_model_falls_back_to_fast() {
        let config = GenerationConfig {
            provider: "ollama".to_string(),
            fast_model: Some("llama3.2".to_string()),
            ..Default::default()
        };
        let generator = create_generator(&config).unwrap();
        assert_eq!(generator.model_for(ModelTier::Fast), "llama3.2");
        assert_eq!(generator.model_for(ModelTier::Quality), "llama3.2");
    }

    #[test]
    fn chat_response_reports_served_model() {
        let body = json!({
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{"message": {"role": "assistant", "content": "A short summary."}}]
        });
        let generation = parse_chat_response(&body, "gpt-4o-mini").unwrap();
        assert_eq!(generation.text, "A short summary.");
        assert_eq!(generation.model, "gpt-4o-mini-2024-07-18");
        assert!(parse_chat_response(&json!({"choices": []}), "m").is_err());
    }

    #[tokio::test]
    async fn disabled_generator_is_a_config_error() {
        let generator = create_generator(&GenerationConfig::default()).unwrap();
        let err = generator
            .generate(&GenerationRequest::new("hi", ModelTier::Fast))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
