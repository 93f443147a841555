//! TOML configuration.
//!
//! The config is loaded once in `main`, validated, and converted into the
//! explicit parameter structs in [`docflow_core::settings`] by
//! [`Config::to_settings`]. Nothing below the binary reads `Config`
//! directly except the provider constructors and the storage layer.
//!
//! Every section except `[db]` is optional and falls back to the defaults
//! shown in `config/docflow.example.toml`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use docflow_core::models::TaskType;
use docflow_core::results::SummaryType;
use docflow_core::settings::{
    ChunkParams, PipelineSettings, RetrievalParams, RetryPolicy, ReviewSettings, Settings,
    WorkerSettings,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub blobs: BlobsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub summarization: SummarizationConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub form_filling: FormFillingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlobsConfig {
    #[serde(default = "default_blob_root")]
    pub root: PathBuf,
}

impl Default for BlobsConfig {
    fn default() -> Self {
        Self {
            root: default_blob_root(),
        }
    }
}

fn default_blob_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: f64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: f64,
    #[serde(default = "default_quota_multiplier")]
    pub quota_backoff_multiplier: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_secs: default_base_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            quota_backoff_multiplier: default_quota_multiplier(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_backoff_secs() -> f64 {
    2.0
}
fn default_max_backoff_secs() -> f64 {
    300.0
}
fn default_quota_multiplier() -> u32 {
    4
}
fn default_poll_interval_ms() -> u64 {
    500
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// `[tasks.<task_type>]`
#[derive(Debug, Deserialize, Clone)]
pub struct TaskConfig {
    #[serde(default)]
    pub visibility_timeout_secs: Option<u64>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: None,
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Stage wiring, e.g. `follow_ups = { ocr = ["indexing"] }`.
    #[serde(default = "default_follow_ups")]
    pub follow_ups: BTreeMap<String, Vec<String>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            follow_ups: default_follow_ups(),
        }
    }
}

fn default_follow_ups() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([("ocr".to_string(), vec!["indexing".to_string()])])
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    250
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for Ollama or an OpenAI-compatible endpoint.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub fast_model: Option<String>,
    #[serde(default)]
    pub quality_model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            fast_model: None,
            quality_model: None,
            url: None,
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            max_retries: default_generation_retries(),
            timeout_secs: default_generation_timeout(),
        }
    }
}

fn default_temperature() -> f32 {
    0.2
}
fn default_max_output_tokens() -> u32 {
    1024
}
fn default_generation_retries() -> u32 {
    2
}
fn default_generation_timeout() -> u64 {
    120
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            min_relevance: default_min_relevance(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_max_top_k() -> usize {
    50
}
fn default_min_relevance() -> f32 {
    0.75
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReviewConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

fn default_confidence_threshold() -> f32 {
    0.8
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizationConfig {
    #[serde(default = "default_summary_type")]
    pub default_type: String,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            default_type: default_summary_type(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

fn default_summary_type() -> String {
    "concise".to_string()
}
fn default_max_input_chars() -> usize {
    50_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Empty means the built-in invoice field list.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Also caps form-filling input.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FormFillingConfig {
    #[serde(default)]
    pub templates: BTreeMap<String, FormTemplateConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FormTemplateConfig {
    pub fields: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7410".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    /// Task configuration for `task_type`, falling back to defaults.
    pub fn task(&self, task_type: TaskType) -> TaskConfig {
        self.tasks
            .get(task_type.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Build the runtime parameter structs.
    pub fn to_settings(&self) -> Result<Settings> {
        let mut visibility = HashMap::new();
        for task_type in TaskType::ALL {
            let secs = self
                .task(task_type)
                .visibility_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| task_type.default_visibility());
            visibility.insert(task_type, secs);
        }

        let mut follow_ups = HashMap::new();
        for (from, to) in &self.pipeline.follow_ups {
            let from: TaskType = from.parse()?;
            let to = to
                .iter()
                .map(|t| t.parse::<TaskType>())
                .collect::<docflow_core::Result<Vec<_>>>()?;
            follow_ups.insert(from, to);
        }

        let summary_type = match self.summarization.default_type.as_str() {
            "concise" => SummaryType::Concise,
            "detailed" => SummaryType::Detailed,
            other => bail!("summarization.default_type must be concise or detailed, got '{}'", other),
        };

        let extraction_fields = if self.extraction.fields.is_empty() {
            docflow_core::settings::default_extraction_fields()
        } else {
            self.extraction.fields.clone()
        };

        Ok(Settings {
            retry: RetryPolicy {
                max_attempts: self.queue.max_attempts,
                base_backoff: Duration::from_secs_f64(self.queue.base_backoff_secs),
                max_backoff: Duration::from_secs_f64(self.queue.max_backoff_secs),
                quota_backoff_multiplier: self.queue.quota_backoff_multiplier,
            },
            worker: WorkerSettings {
                visibility,
                embed_batch_size: self.embedding.batch_size,
            },
            pipeline: PipelineSettings {
                follow_ups,
                chunking: ChunkParams {
                    max_tokens: self.chunking.max_tokens,
                    overlap_tokens: self.chunking.overlap_tokens,
                },
                summary_type,
                max_summary_input_chars: self.summarization.max_input_chars,
                max_extraction_input_chars: self.extraction.max_input_chars,
                extraction_fields,
                form_templates: self
                    .form_filling
                    .templates
                    .iter()
                    .map(|(name, t)| (name.clone(), t.fields.clone()))
                    .collect(),
            },
            retrieval: RetrievalParams {
                default_top_k: self.retrieval.top_k,
                max_top_k: self.retrieval.max_top_k,
                min_relevance: self.retrieval.min_relevance,
            },
            review: ReviewSettings {
                confidence_threshold: self.review.confidence_threshold,
            },
        })
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    // Validate queue
    if config.queue.max_attempts == 0 {
        bail!("queue.max_attempts must be >= 1");
    }
    let backoffs = [config.queue.base_backoff_secs, config.queue.max_backoff_secs];
    if backoffs.iter().any(|s| !s.is_finite() || *s < 0.0) {
        bail!("queue backoff durations must be >= 0");
    }
    for (name, task) in &config.tasks {
        name.parse::<TaskType>()
            .with_context(|| format!("invalid [tasks.{}] section", name))?;
        if task.concurrency == 0 {
            bail!("tasks.{}.concurrency must be >= 1", name);
        }
        if task.visibility_timeout_secs == Some(0) {
            bail!("tasks.{}.visibility_timeout_secs must be > 0", name);
        }
    }

    // Validate retrieval
    if config.retrieval.top_k == 0 || config.retrieval.top_k > config.retrieval.max_top_k {
        bail!("retrieval.top_k must be in [1, retrieval.max_top_k]");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_relevance) {
        bail!("retrieval.min_relevance must be in [-1.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.review.confidence_threshold) {
        bail!("review.confidence_threshold must be in [0.0, 1.0]");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.provider != "local" {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    // Validate generation
    match config.generation.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.generation.is_enabled() && config.generation.fast_model.is_none() {
        bail!(
            "generation.fast_model must be specified when provider is '{}'",
            config.generation.provider
        );
    }

    for (name, template) in &config.form_filling.templates {
        if template.fields.is_empty() {
            bail!("form_filling.templates.{}.fields must not be empty", name);
        }
    }

    config.to_settings().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [db]
        path = "./data/docflow.sqlite"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        let settings = config.to_settings().unwrap();
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retrieval.min_relevance, 0.75);
        assert_eq!(
            settings.worker.visibility_for(TaskType::Ocr),
            Duration::from_secs(120)
        );
        assert_eq!(
            settings.pipeline.follow_ups_for(TaskType::Ocr),
            &[TaskType::Indexing]
        );
        assert_eq!(config.task(TaskType::Indexing).concurrency, 1);
    }

    #[test]
    fn task_sections_override_visibility() {
        let config = parse_config(
            r#"
            [db]
            path = "x.sqlite"

            [tasks.form_filling]
            visibility_timeout_secs = 42
            concurrency = 3

            [form_filling.templates.w9]
            fields = ["name", "tin"]
            "#,
        )
        .unwrap();
        let settings = config.to_settings().unwrap();
        assert_eq!(
            settings.worker.visibility_for(TaskType::FormFilling),
            Duration::from_secs(42)
        );
        assert_eq!(config.task(TaskType::FormFilling).concurrency, 3);
        assert_eq!(settings.pipeline.form_templates["w9"], vec!["name", "tin"]);
    }

    #[test]
    fn extraction_has_its_own_input_cap() {
        let config = parse_config(
            r#"
            [db]
            path = "x.sqlite"

            [summarization]
            max_input_chars = 80000

            [extraction]
            max_input_chars = 12000
            "#,
        )
        .unwrap();
        let settings = config.to_settings().unwrap();
        assert_eq!(settings.pipeline.max_summary_input_chars, 80_000);
        assert_eq!(settings.pipeline.max_extraction_input_chars, 12_000);

        let defaults = parse_config(MINIMAL).unwrap().to_settings().unwrap();
        assert_eq!(defaults.pipeline.max_extraction_input_chars, 50_000);
    }

    #[test]
    fn unknown_task_section_is_rejected() {
        let err = parse_config(
            r#"
            [db]
            path = "x.sqlite"
            [tasks.rag]
            concurrency = 1
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("tasks.rag"));
    }

    #[test]
    fn enabled_embedding_requires_model_and_dims() {
        let err = parse_config(
            r#"
            [db]
            path = "x.sqlite"
            [embedding]
            provider = "openai"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn unknown_follow_up_stage_is_rejected() {
        assert!(parse_config(
            r#"
            [db]
            path = "x.sqlite"
            [pipeline]
            follow_ups = { ocr = ["translate"] }
            "#,
        )
        .is_err());
    }
}
