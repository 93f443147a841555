//! Deterministic primitives and an in-memory pipeline for tests.
//!
//! Compiled for this crate's unit tests and, behind the `testing` feature,
//! for integration tests of crates that depend on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::blob::{content_hash, InMemoryBlobStore};
use crate::embedding::{EmbeddingProvider, EmbeddingVersion};
use crate::error::{PipelineError, Result};
use crate::intake::Upload;
use crate::models::{
    BlobLocator, DeadLetter, Document, DocumentChunk, DocumentId, DocumentStatus, JobId, Lease,
    NewJob, ProcessingJob, TaskType, TenantId, UserId,
};
use crate::pipeline::Pipeline;
use crate::primitives::{
    Generation, GenerationProvider, GenerationRequest, ModelTier, OcrProvider, Primitives,
    RecognizedText,
};
use crate::queue::memory::InMemoryQueue;
use crate::queue::{Enqueued, JobQueue, Nack, NackOutcome};
use crate::results::{OcrOutput, TaskCommit, TaskOutput};
use crate::settings::Settings;
use crate::store::memory::InMemoryStore;
use crate::store::Store;
use crate::worker::WorkerStep;

// ============ Embedder ============

/// Bag-of-words embedder: each lowercase alphanumeric word is hashed into
/// one of `dims` buckets and the vector is L2-normalized. Texts sharing
/// all their words score 1.0; texts sharing none score 0.0 (barring
/// bucket collisions).
pub struct HashEmbedder {
    model: String,
    dims: usize,
    calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::with_model("bow-test", 256)
    }

    pub fn with_model(model: &str, dims: usize) -> Self {
        Self {
            model: model.to_string(),
            dims,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = fnv1a(&word.to_lowercase()) as usize % self.dims;
            v[bucket] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in s.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

// ============ Generator ============

type Responder = Box<dyn Fn(&GenerationRequest) -> Result<String> + Send + Sync>;

/// Generator that answers from a closure and records every prompt.
pub struct ScriptedGenerator {
    responder: Responder,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn with<F>(responder: F) -> Self
    where
        F: Fn(&GenerationRequest) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
        }
    }

    pub fn replying(text: &str) -> Self {
        let text = text.to_string();
        Self::with(move |_| Ok(text.clone()))
    }

    /// Plausible replies for every prompt the pipeline builds.
    pub fn default_replies() -> Self {
        Self::with(|req| {
            Ok(if req.prompt.starts_with("Extract") {
                "{}".to_string()
            } else if req.prompt.starts_with("Answer the question") {
                "Grounded answer [1].".to_string()
            } else {
                "- first point\n- second point".to_string()
            })
        })
    }

    /// Fail the first `n` calls with `QuotaExceeded`.
    pub fn rate_limited(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => "fast-test",
            ModelTier::Quality => "quality-test",
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(PipelineError::QuotaExceeded("429 from scripted generator".into()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        Ok(Generation {
            text: (self.responder)(request)?,
            model: self.model_for(request.tier).to_string(),
        })
    }
}

// ============ OCR ============

/// OCR that reads `text/*` blobs as UTF-8 and fails the first `n` calls
/// with a transient error.
pub struct FlakyOcr {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyOcr {
    pub fn new() -> Self {
        Self::failing(0)
    }

    pub fn failing(n: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(n),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for FlakyOcr {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrProvider for FlakyOcr {
    fn method(&self) -> &str {
        "native"
    }

    async fn recognize(&self, bytes: &[u8], mime_type: &str) -> Result<RecognizedText> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(PipelineError::TransientIo("ocr backend timed out".into()));
        }
        if !mime_type.starts_with("text/") {
            return Err(PipelineError::MalformedInput(format!(
                "unsupported mime type {}",
                mime_type
            )));
        }
        let text = String::from_utf8_lossy(bytes).into_owned();
        Ok(RecognizedText {
            page_count: text.matches('\u{0C}').count() as u32 + 1,
            text,
            confidence: 0.95,
            method: "native".to_string(),
        })
    }
}

// ============ Queue ============

/// In-memory queue that lets a second worker run a job to completion
/// before the call that made it visible returns: inside `enqueue`, and
/// inside a `nack` that requeued it.
#[derive(Default)]
pub struct EagerQueue {
    inner: InMemoryQueue,
    pipeline: OnceLock<Pipeline>,
}

impl EagerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipeline whose queue is an [`EagerQueue`] over in-memory stores.
    pub fn pipeline(generator: ScriptedGenerator) -> Pipeline {
        let queue = Arc::new(EagerQueue::new());
        let pipeline = Pipeline::new(
            Arc::new(InMemoryStore::new()),
            queue.clone(),
            Arc::new(InMemoryBlobStore::new()),
            Primitives {
                embedder: Arc::new(HashEmbedder::new()),
                generator: Arc::new(generator),
                ocr: Arc::new(FlakyOcr::new()),
            },
            test_settings(),
        );
        let _ = queue.pipeline.set(pipeline.clone());
        pipeline
    }

    async fn run_other_worker(&self, task_type: TaskType) -> Result<()> {
        if let Some(pipeline) = self.pipeline.get() {
            let step = pipeline.worker("eager-worker").process_one(task_type).await?;
            tracing::debug!(?step, "eager worker ran");
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for EagerQueue {
    async fn enqueue(&self, job: NewJob) -> Result<Enqueued> {
        let task_type = job.task_type;
        let enqueued = self.inner.enqueue(job).await?;
        self.run_other_worker(task_type).await?;
        Ok(enqueued)
    }

    async fn lease(&self, task_type: TaskType, visibility: Duration) -> Result<Option<Lease>> {
        self.inner.lease(task_type, visibility).await
    }

    async fn ack(&self, lease: &Lease) -> Result<()> {
        self.inner.ack(lease).await
    }

    async fn nack(&self, lease: &Lease, nack: Nack) -> Result<NackOutcome> {
        let outcome = self.inner.nack(lease, nack).await?;
        if matches!(outcome, NackOutcome::Requeued { .. }) {
            self.run_other_worker(lease.job.task_type).await?;
        }
        Ok(outcome)
    }

    async fn get_job(&self, tenant: &TenantId, id: &JobId) -> Result<Option<ProcessingJob>> {
        self.inner.get_job(tenant, id).await
    }

    async fn dead_letters(&self, tenant: &TenantId, limit: usize) -> Result<Vec<DeadLetter>> {
        self.inner.dead_letters(tenant, limit).await
    }

    async fn replay(&self, tenant: &TenantId, dead_letter_id: &str) -> Result<ProcessingJob> {
        self.inner.replay(tenant, dead_letter_id).await
    }
}

// ============ Fixtures ============

/// A document row (no blob) for store-level tests.
pub fn document(tenant: &str, id: &str) -> Document {
    let tenant_id = TenantId::from(tenant);
    let doc_id = DocumentId::from(id);
    let now = Utc::now();
    Document {
        storage_locator: BlobLocator::for_upload(&tenant_id, &doc_id, "doc.txt")
            .unwrap_or_else(|_| panic!("bad fixture locator")),
        id: doc_id,
        tenant_id,
        user_id: UserId::from("u1"),
        filename: "doc.txt".to_string(),
        mime_type: "text/plain".to_string(),
        size_bytes: 0,
        content_sha256: content_hash(b""),
        status: DocumentStatus::Uploaded,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

/// A chunk of `doc` with a hand-made embedding.
pub fn chunk(doc: &Document, index: i64, text: &str, embedding: Vec<f32>) -> DocumentChunk {
    let hash = content_hash(text.as_bytes());
    DocumentChunk {
        chunk_id: format!("{}-{}-{}", doc.id, index, &hash[..8]),
        tenant_id: doc.tenant_id.clone(),
        document_id: doc.id.clone(),
        chunk_index: index,
        text: text.to_string(),
        hash,
        token_count: text.len().div_ceil(4),
        embedding_version: EmbeddingVersion::new("test-embed", embedding.len()),
        embedding,
        generation: 0,
        metadata: serde_json::json!({}),
    }
}

/// Settings with zero backoff so retries are immediately visible.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.retry.base_backoff = Duration::ZERO;
    settings
}

/// An in-memory pipeline with handles on every test double.
pub struct TestPipeline {
    pub pipeline: Pipeline,
    pub store: Arc<InMemoryStore>,
    pub queue: Arc<InMemoryQueue>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub embedder: Arc<HashEmbedder>,
    pub generator: Arc<ScriptedGenerator>,
    pub ocr: Arc<FlakyOcr>,
    settings: Settings,
}

impl TestPipeline {
    pub fn new() -> Self {
        Self::assemble(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryQueue::new()),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(HashEmbedder::new()),
            Arc::new(ScriptedGenerator::default_replies()),
            Arc::new(FlakyOcr::new()),
            test_settings(),
        )
    }

    pub fn with_generator(generator: ScriptedGenerator) -> Self {
        let t = Self::new();
        Self::assemble(
            t.store,
            t.queue,
            t.blobs,
            t.embedder,
            Arc::new(generator),
            t.ocr,
            t.settings,
        )
    }

    pub fn with_ocr(ocr: FlakyOcr) -> Self {
        let t = Self::new();
        Self::assemble(
            t.store,
            t.queue,
            t.blobs,
            t.embedder,
            t.generator,
            Arc::new(ocr),
            t.settings,
        )
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        self.with_settings(|s| s.retry.max_attempts = max_attempts)
    }

    pub fn with_template(self, name: &str, fields: &[&str]) -> Self {
        self.with_settings(|s| {
            s.pipeline.form_templates.insert(
                name.to_string(),
                fields.iter().map(|f| f.to_string()).collect(),
            );
        })
    }

    /// Rebuild the pipeline with edited settings, keeping every double.
    pub fn with_settings(self, edit: impl FnOnce(&mut Settings)) -> Self {
        let mut settings = self.settings;
        edit(&mut settings);
        Self::assemble(
            self.store,
            self.queue,
            self.blobs,
            self.embedder,
            self.generator,
            self.ocr,
            settings,
        )
    }

    fn assemble(
        store: Arc<InMemoryStore>,
        queue: Arc<InMemoryQueue>,
        blobs: Arc<InMemoryBlobStore>,
        embedder: Arc<HashEmbedder>,
        generator: Arc<ScriptedGenerator>,
        ocr: Arc<FlakyOcr>,
        settings: Settings,
    ) -> Self {
        let pipeline = Pipeline::new(
            store.clone(),
            queue.clone(),
            blobs.clone(),
            Primitives {
                embedder: embedder.clone(),
                generator: generator.clone(),
                ocr: ocr.clone(),
            },
            settings.clone(),
        );
        Self {
            pipeline,
            store,
            queue,
            blobs,
            embedder,
            generator,
            ocr,
            settings,
        }
    }

    pub async fn upload(&self, tenant: &str, filename: &str, bytes: &[u8]) -> Document {
        self.upload_with_mime(tenant, filename, bytes, "text/plain").await
    }

    pub async fn upload_with_mime(
        &self,
        tenant: &str,
        filename: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Document {
        self.pipeline
            .intake()
            .upload(Upload {
                tenant_id: TenantId::from(tenant),
                user_id: UserId::from("u1"),
                filename: filename.to_string(),
                mime_type: mime_type.to_string(),
                bytes: bytes.to_vec(),
            })
            .await
            .unwrap_or_else(|e| panic!("upload failed: {}", e))
    }

    pub async fn enqueue(&self, doc: &Document, task_type: TaskType) -> JobId {
        self.enqueue_with(doc, task_type, serde_json::json!({})).await
    }

    pub async fn enqueue_with(
        &self,
        doc: &Document,
        task_type: TaskType,
        payload: serde_json::Value,
    ) -> JobId {
        self.pipeline
            .dispatcher()
            .enqueue(&doc.tenant_id, &doc.id, task_type, payload)
            .await
            .unwrap_or_else(|e| panic!("enqueue failed: {}", e))
    }

    /// Process `task_type` jobs until the queue is idle.
    pub async fn drain(&self, task_type: TaskType) -> Vec<WorkerStep> {
        let worker = self.pipeline.worker("test-worker");
        let mut steps = Vec::new();
        for _ in 0..100 {
            match worker.process_one(task_type).await {
                Ok(WorkerStep::Idle) => break,
                Ok(step) => steps.push(step),
                Err(e) => panic!("worker failed: {}", e),
            }
        }
        steps
    }

    /// Store an OCR result for `doc` as if an earlier stage produced it.
    pub async fn commit_ocr(&self, doc: &Document, text: &str) {
        self.store
            .commit_task(&TaskCommit {
                tenant_id: doc.tenant_id.clone(),
                document_id: doc.id.clone(),
                job_id: JobId::from("seed-ocr"),
                output: TaskOutput::Ocr(OcrOutput {
                    text: text.to_string(),
                    confidence: 0.9,
                    page_count: 1,
                    method: "native".to_string(),
                }),
            })
            .await
            .unwrap_or_else(|e| panic!("commit failed: {}", e));
    }

    /// Visible task state per task type.
    pub async fn task_states(&self, doc: &Document) -> HashMap<TaskType, crate::models::TaskState> {
        self.store
            .task_statuses(&doc.tenant_id, &doc.id)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|s| (s.task_type, s.state))
            .collect()
    }
}

impl Default for TestPipeline {
    fn default() -> Self {
        Self::new()
    }
}
