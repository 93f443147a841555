//! Task handlers, one per [`TaskType`].
//!
//! [`run`] is an exhaustive `match` over the closed task enum. Handlers only
//! compute a [`TaskOutput`]; persisting it, status transitions, and the
//! ack/nack decision belong to the [`worker`](crate::worker).
//!
//! Handlers must be safe to re-run for the same job: indexing replaces the
//! chunk set with content-derived ids, and form filling replaces its
//! derived blob, except while a reviewed result still points at it.

use std::collections::BTreeMap;

use serde_json::json;

use crate::chunk::{chunk_id, chunk_text};
use crate::embedding::embed_batched;
use crate::error::{PipelineError, Result};
use crate::extraction;
use crate::models::{
    AuditAction, BlobLocator, Document, DocumentChunk, JobMessage, NewAuditEntry, TaskType,
};
use crate::pipeline::Pipeline;
use crate::results::{FormFillOutput, IndexingOutput, OcrOutput, ReviewState, TaskOutput};
use crate::review::effective_view;
use crate::summarize::{self, ModelPreference};

/// Execute the handler for `job.task_type`.
pub async fn run(
    pipeline: &Pipeline,
    job: &JobMessage,
    doc: &Document,
    blob: &[u8],
) -> Result<TaskOutput> {
    match job.task_type {
        TaskType::Ocr => ocr(pipeline, job, doc, blob).await.map(TaskOutput::Ocr),
        TaskType::Extraction => {
            let text = document_text(pipeline, doc, blob).await?;
            let settings = &pipeline.settings.pipeline;
            let fields = requested_fields(job, &settings.extraction_fields);
            extraction::extract(
                pipeline.primitives.generator.as_ref(),
                &text,
                &fields,
                settings.max_extraction_input_chars,
            )
            .await
            .map(TaskOutput::Extraction)
        }
        TaskType::Summarization => summarization(pipeline, job, doc, blob)
            .await
            .map(TaskOutput::Summary),
        TaskType::Indexing => indexing(pipeline, job, doc, blob)
            .await
            .map(TaskOutput::Indexing),
        TaskType::FormFilling => form_filling(pipeline, job, doc, blob)
            .await
            .map(TaskOutput::FormFill),
    }
}

async fn ocr(
    pipeline: &Pipeline,
    job: &JobMessage,
    doc: &Document,
    blob: &[u8],
) -> Result<OcrOutput> {
    let ocr = &pipeline.primitives.ocr;
    if let Some(method) = job.option_str("ocr_method") {
        if method != "auto" && method != ocr.method() {
            return Err(PipelineError::MalformedInput(format!(
                "ocr method '{}' is not available; configured method is '{}'",
                method,
                ocr.method()
            )));
        }
    }
    let recognized = ocr.recognize(blob, &doc.mime_type).await?;
    Ok(OcrOutput {
        text: recognized.text,
        confidence: recognized.confidence,
        page_count: recognized.page_count,
        method: recognized.method,
    })
}

/// The document's text: the stored OCR result (with human corrections
/// applied) when there is one, otherwise a fresh OCR pass over the blob.
pub async fn document_text(pipeline: &Pipeline, doc: &Document, blob: &[u8]) -> Result<String> {
    let store = &pipeline.store;
    if let Some(result) = store
        .get_result(&doc.tenant_id, &doc.id, TaskType::Ocr)
        .await?
    {
        let corrections = store
            .corrections(&doc.tenant_id, &doc.id, TaskType::Ocr)
            .await?;
        let view = effective_view(result, corrections, &pipeline.settings.review);
        if let Some(text) = view.effective.get("text").and_then(|t| t.as_str()) {
            return Ok(text.to_string());
        }
    }
    let recognized = pipeline
        .primitives
        .ocr
        .recognize(blob, &doc.mime_type)
        .await?;
    Ok(recognized.text)
}

fn requested_fields(job: &JobMessage, defaults: &[String]) -> Vec<String> {
    job.payload
        .get("fields")
        .and_then(|f| f.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        })
        .filter(|list| !list.is_empty())
        .unwrap_or_else(|| defaults.to_vec())
}

async fn summarization(
    pipeline: &Pipeline,
    job: &JobMessage,
    doc: &Document,
    blob: &[u8],
) -> Result<crate::results::SummaryOutput> {
    let settings = &pipeline.settings.pipeline;
    let summary_type = match job.option_str("summary_type") {
        Some(s) => crate::results::SummaryType::parse(s)?,
        None => settings.summary_type,
    };
    let preference = match job.option_str("model") {
        Some(s) => ModelPreference::parse(s)?,
        None => ModelPreference::Auto,
    };
    let text = document_text(pipeline, doc, blob).await?;
    summarize::summarize(
        pipeline.primitives.generator.as_ref(),
        &text,
        summary_type,
        preference,
        settings.max_summary_input_chars,
    )
    .await
}

async fn indexing(
    pipeline: &Pipeline,
    job: &JobMessage,
    doc: &Document,
    blob: &[u8],
) -> Result<IndexingOutput> {
    let text = document_text(pipeline, doc, blob).await?;
    let pieces = chunk_text(&text, &pipeline.settings.pipeline.chunking);

    let embedder = pipeline.primitives.embedder.as_ref();
    let version = embedder.version();
    let texts: Vec<String> = pieces.iter().map(|c| c.text.clone()).collect();
    let vectors = embed_batched(
        embedder,
        &texts,
        pipeline.settings.worker.embed_batch_size,
    )
    .await?;

    let chunks: Vec<DocumentChunk> = pieces
        .iter()
        .zip(vectors)
        .map(|(piece, embedding)| DocumentChunk {
            chunk_id: chunk_id(doc.id.as_str(), piece),
            tenant_id: doc.tenant_id.clone(),
            document_id: doc.id.clone(),
            chunk_index: piece.chunk_index,
            text: piece.text.clone(),
            hash: piece.hash.clone(),
            token_count: piece.token_count,
            embedding,
            embedding_version: version.clone(),
            generation: 0,
            metadata: match piece.page_number {
                Some(page) => json!({ "filename": doc.filename, "page_number": page }),
                None => json!({ "filename": doc.filename }),
            },
        })
        .collect();

    let generation = pipeline
        .store
        .replace_chunks(&doc.tenant_id, &doc.id, &chunks)
        .await?;
    pipeline
        .store
        .append_audit(
            &NewAuditEntry::new(&doc.tenant_id, AuditAction::ChunksReplaced)
                .document(&doc.id)
                .job(&job.job_id, job.task_type)
                .details(json!({
                    "chunk_count": chunks.len(),
                    "generation": generation,
                    "embedding_version": version.to_string(),
                })),
        )
        .await?;
    tracing::info!(
        document_id = %doc.id,
        chunks = chunks.len(),
        generation,
        "chunks replaced"
    );

    Ok(IndexingOutput {
        chunk_count: chunks.len(),
        embedding_model: version.model,
        embedding_dims: version.dims,
        generation,
        indexed: true,
    })
}

async fn form_filling(
    pipeline: &Pipeline,
    job: &JobMessage,
    doc: &Document,
    blob: &[u8],
) -> Result<FormFillOutput> {
    let settings = &pipeline.settings.pipeline;
    let template = job.option_str("template").ok_or_else(|| {
        PipelineError::MalformedInput("form filling requires a 'template' option".to_string())
    })?;
    let template_fields = settings.form_templates.get(template).ok_or_else(|| {
        PipelineError::MalformedInput(format!("unknown form template '{}'", template))
    })?;

    let text = document_text(pipeline, doc, blob).await?;
    let (fields, model_used) = extraction::extract_fields(
        pipeline.primitives.generator.as_ref(),
        &text,
        template_fields,
        settings.max_extraction_input_chars,
    )
    .await?;

    let missing_fields: Vec<String> = template_fields
        .iter()
        .filter(|f| !fields.contains_key(*f))
        .cloned()
        .collect();
    let form: BTreeMap<&str, serde_json::Value> = template_fields
        .iter()
        .map(|f| {
            let value = fields
                .get(f)
                .map(|e| e.value.clone())
                .unwrap_or(serde_json::Value::Null);
            (f.as_str(), value)
        })
        .collect();
    let bytes = serde_json::to_vec_pretty(&json!({
        "template": template,
        "document_id": doc.id,
        "fields": form,
    }))?;

    let locator = BlobLocator::for_derived(&doc.tenant_id, &doc.id, &format!("{}.json", template))?;
    if reviewed_form_owns(pipeline, doc, &locator).await? {
        tracing::info!(locator = %locator, "reviewed form kept; derived blob not rewritten");
    } else {
        pipeline.blobs.replace(&locator, &bytes).await?;
    }

    Ok(FormFillOutput {
        template: template.to_string(),
        fields,
        missing_fields,
        output_locator: locator,
        model_used,
    })
}

/// Whether the stored form-filling result has left `extracted` and points
/// at `locator`. Its commit will be frozen, so the artifact must stay too.
async fn reviewed_form_owns(
    pipeline: &Pipeline,
    doc: &Document,
    locator: &BlobLocator,
) -> Result<bool> {
    let stored = pipeline
        .store
        .get_result(&doc.tenant_id, &doc.id, TaskType::FormFilling)
        .await?;
    Ok(stored.is_some_and(|result| {
        result.review_state != ReviewState::Extracted
            && matches!(&result.output, TaskOutput::FormFill(form) if &form.output_locator == locator)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::models::UserId;
    use crate::review::ReviewAction;
    use crate::testing::{ScriptedGenerator, TestPipeline};
    use crate::worker::WorkerStep;

    fn message(doc: &Document, task_type: TaskType, payload: serde_json::Value) -> JobMessage {
        JobMessage {
            job_id: crate::models::JobId::from("job-1"),
            tenant_id: doc.tenant_id.clone(),
            document_id: doc.id.clone(),
            task_type,
            storage_locator: doc.storage_locator.clone(),
            attempt_count: 1,
            enqueued_at: chrono::Utc::now(),
            payload,
        }
    }

    #[tokio::test]
    async fn empty_document_indexes_zero_chunks() {
        let t = TestPipeline::new();
        let doc = t.upload("t1", "empty.txt", b"   ").await;
        let out = run(&t.pipeline, &message(&doc, TaskType::Indexing, json!({})), &doc, b"   ")
            .await
            .unwrap();
        match out {
            TaskOutput::Indexing(i) => {
                assert!(i.indexed);
                assert_eq!(i.chunk_count, 0);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[tokio::test]
    async fn indexing_prefers_corrected_ocr_text() {
        let t = TestPipeline::new();
        let doc = t.upload("t1", "scan.txt", b"raw blob text").await;
        t.commit_ocr(&doc, "ocr text from earlier stage").await;
        let text = document_text(&t.pipeline, &doc, b"raw blob text").await.unwrap();
        assert_eq!(text, "ocr text from earlier stage");
    }

    #[tokio::test]
    async fn unknown_ocr_method_is_permanent() {
        let t = TestPipeline::new();
        let doc = t.upload("t1", "a.txt", b"abc").await;
        let err = run(
            &t.pipeline,
            &message(&doc, TaskType::Ocr, json!({"ocr_method": "documentai"})),
            &doc,
            b"abc",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedInput(_)));
    }

    #[tokio::test]
    async fn form_fill_writes_derived_blob_and_lists_missing() {
        let gen = ScriptedGenerator::replying(
            r#"{"family_name": {"value": "Popescu", "confidence": 0.9}, "nationality": {"value": null}}"#,
        );
        let t = TestPipeline::with_generator(gen).with_template("id_card", &["family_name", "nationality"]);
        let doc = t.upload("t1", "id.txt", b"POPESCU ION").await;
        let msg = message(&doc, TaskType::FormFilling, json!({"template": "id_card"}));

        let out = run(&t.pipeline, &msg, &doc, b"POPESCU ION").await.unwrap();
        let TaskOutput::FormFill(form) = out else {
            panic!("expected form output");
        };
        assert_eq!(form.missing_fields, vec!["nationality".to_string()]);
        assert!(form.output_locator.as_str().ends_with("/derived/id_card.json"));
        let written = t.pipeline.blobs.get(&form.output_locator).await.unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&written).unwrap();
        assert_eq!(parsed["fields"]["family_name"], "Popescu");

        // A redelivered job rewrites identical bytes.
        assert!(run(&t.pipeline, &msg, &doc, b"POPESCU ION").await.is_ok());
    }

    async fn family_name(t: &TestPipeline, locator: &BlobLocator) -> serde_json::Value {
        let bytes = t.pipeline.blobs.get(locator).await.unwrap().unwrap();
        let form: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        form["fields"]["family_name"].clone()
    }

    #[tokio::test]
    async fn form_fill_rerun_with_new_output_replaces_artifact() {
        let calls = AtomicUsize::new(0);
        let gen = ScriptedGenerator::with(move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!(
                r#"{{"family_name": {{"value": "Popescu {}", "confidence": 0.9}}}}"#,
                n
            ))
        });
        let t = TestPipeline::with_generator(gen).with_template("id_card", &["family_name"]);
        let doc = t.upload("t1", "id.txt", b"POPESCU ION").await;
        let locator = BlobLocator::for_derived(&doc.tenant_id, &doc.id, "id_card.json").unwrap();

        t.enqueue_with(&doc, TaskType::FormFilling, json!({"template": "id_card"})).await;
        t.enqueue_with(&doc, TaskType::FormFilling, json!({"template": "id_card"})).await;
        assert_eq!(
            t.drain(TaskType::FormFilling).await,
            vec![WorkerStep::Acked, WorkerStep::Acked]
        );
        assert_eq!(family_name(&t, &locator).await, "Popescu 2");

        // A reviewed form keeps its artifact.
        t.pipeline
            .reviews()
            .apply(
                &doc.tenant_id,
                &doc.id,
                TaskType::FormFilling,
                &ReviewAction::MarkReviewed { note: None },
                &UserId::from("u2"),
            )
            .await
            .unwrap();
        t.enqueue_with(&doc, TaskType::FormFilling, json!({"template": "id_card"})).await;
        assert_eq!(t.drain(TaskType::FormFilling).await, vec![WorkerStep::Acked]);
        assert_eq!(family_name(&t, &locator).await, "Popescu 2");
    }

    #[tokio::test]
    async fn extraction_input_is_capped_by_its_own_limit() {
        let t = TestPipeline::new().with_settings(|s| {
            s.pipeline.max_extraction_input_chars = 40;
            s.pipeline.max_summary_input_chars = 10_000;
        });
        let body = format!("Invoice 42 from Acme. {} closing remark", "filler ".repeat(50));
        let doc = t.upload("t1", "invoice.txt", body.as_bytes()).await;
        t.enqueue(&doc, TaskType::Extraction).await;
        t.enqueue(&doc, TaskType::Summarization).await;
        assert_eq!(t.drain(TaskType::Extraction).await, vec![WorkerStep::Acked]);
        assert_eq!(t.drain(TaskType::Summarization).await, vec![WorkerStep::Acked]);

        let prompts = t.generator.prompts();
        let extraction = prompts.iter().find(|p| p.starts_with("Extract")).unwrap();
        assert!(extraction.contains("Invoice 42"));
        assert!(!extraction.contains("closing remark"));
        let summary = prompts.iter().find(|p| !p.starts_with("Extract")).unwrap();
        assert!(summary.contains("closing remark"));
    }

    #[tokio::test]
    async fn form_fill_without_template_is_malformed() {
        let t = TestPipeline::new();
        let doc = t.upload("t1", "id.txt", b"x").await;
        let err = run(&t.pipeline, &message(&doc, TaskType::FormFilling, json!({})), &doc, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedInput(_)));
    }
}
