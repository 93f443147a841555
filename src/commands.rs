//! CLI command implementations.
//!
//! Each `run_*` function opens the pipeline from config, performs one
//! operation, and prints the outcome to stdout. Structured results are
//! printed as pretty JSON so they can be piped into `jq`; logs go to
//! stderr.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

use docflow_core::intake::Upload;
use docflow_core::models::{AuditQuery, DocumentId, JobId, TaskType, TenantId, UserId};
use docflow_core::retrieval::{QueryRequest, QueryStatus};
use docflow_core::review::ReviewAction;

use crate::config::Config;
use crate::migrate;
use crate::runner::{run_workers, RunOptions};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run_init(config: &Config) -> Result<()> {
    let applied = migrate::run_migrations(config).await?;
    std::fs::create_dir_all(&config.blobs.root).with_context(|| {
        format!("Failed to create blob root: {}", config.blobs.root.display())
    })?;
    println!(
        "Database initialized successfully ({} migration(s) applied, schema v{}).",
        applied,
        migrate::latest_version()
    );
    Ok(())
}

/// MIME type from a file extension, for uploads without `--mime`.
pub fn detect_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => crate::providers::ocr::MIME_PDF,
        Some("docx") => crate::providers::ocr::MIME_DOCX,
        Some("pptx") => crate::providers::ocr::MIME_PPTX,
        Some("xlsx") => crate::providers::ocr::MIME_XLSX,
        Some("md") => "text/markdown",
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        Some("html" | "htm") => "text/html",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("tif" | "tiff") => "image/tiff",
        _ => "application/octet-stream",
    }
}

pub async fn run_upload(
    config: &Config,
    tenant: &str,
    path: &Path,
    user: &str,
    mime: Option<String>,
) -> Result<()> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?
        .to_string();
    let mime_type = mime.unwrap_or_else(|| detect_mime_type(path).to_string());

    let pipeline = crate::open_pipeline(config).await?;
    let doc = pipeline
        .intake()
        .upload(Upload {
            tenant_id: TenantId::from(tenant),
            user_id: UserId::from(user),
            filename,
            mime_type,
            bytes,
        })
        .await?;
    println!("Uploaded {} ({}, {} bytes)", doc.id, doc.mime_type, doc.size_bytes);
    println!("  locator: {}", doc.storage_locator);
    println!("  sha256:  {}", doc.content_sha256);
    Ok(())
}

pub async fn run_enqueue(
    config: &Config,
    tenant: &str,
    document: &str,
    task: &str,
    payload: Option<String>,
) -> Result<()> {
    let task_type: TaskType = task.parse()?;
    let payload: serde_json::Value = match payload {
        Some(raw) => serde_json::from_str(&raw).context("--payload must be a JSON object")?,
        None => serde_json::json!({}),
    };
    if !payload.is_object() {
        bail!("--payload must be a JSON object");
    }
    let pipeline = crate::open_pipeline(config).await?;
    let job_id = pipeline
        .dispatcher()
        .enqueue(
            &TenantId::from(tenant),
            &DocumentId::from(document),
            task_type,
            payload,
        )
        .await?;
    println!("Enqueued {} job {}", task_type, job_id);
    Ok(())
}

pub async fn run_status(config: &Config, tenant: &str, document: &str) -> Result<()> {
    let pipeline = crate::open_pipeline(config).await?;
    let view = pipeline
        .intake()
        .describe(&TenantId::from(tenant), &DocumentId::from(document))
        .await?;
    let doc = &view.document;
    println!("{}  {}  [{}]", doc.id, doc.filename, doc.status);
    println!("  uploaded: {} by {}", doc.created_at.to_rfc3339(), doc.user_id);
    if let Some(at) = doc.deleted_at {
        println!("  deleted:  {}", at.to_rfc3339());
    }
    if view.tasks.is_empty() {
        println!("  no tasks");
    }
    for task in &view.tasks {
        print!("  {:<14} {:<11}", task.task_type.as_str(), task.state.as_str());
        if let Some(job) = &task.job_id {
            print!(" job {}", job);
        }
        if let Some(error) = &task.error {
            print!(" error: {}", error);
        }
        println!();
    }
    Ok(())
}

pub async fn run_work(config: &Config, options: RunOptions) -> Result<()> {
    let pipeline = crate::open_pipeline(config).await?;
    let report = run_workers(pipeline, config, options).await?;
    for (task_type, tally) in &report.tasks {
        println!(
            "{:<14} acked {}  retrying {}  dead-lettered {}  skipped {}",
            task_type.as_str(),
            tally.acked,
            tally.retrying,
            tally.dead_lettered,
            tally.skipped
        );
    }
    if !report.halted.is_empty() {
        for reason in &report.halted {
            eprintln!("halted: {}", reason);
        }
        bail!("{} worker(s) halted", report.halted.len());
    }
    Ok(())
}

pub async fn run_query(
    config: &Config,
    tenant: &str,
    question: &str,
    documents: Vec<String>,
    top_k: Option<usize>,
) -> Result<()> {
    let pipeline = crate::open_pipeline(config).await?;
    let mut request = QueryRequest::new(TenantId::from(tenant), question);
    if !documents.is_empty() {
        request.document_ids = Some(documents.into_iter().map(DocumentId::new).collect());
    }
    request.top_k = top_k;
    let response = pipeline.query_engine().query(&request).await?;

    match (response.status, &response.answer) {
        (QueryStatus::Answered, Some(answer)) => {
            println!("{}", answer);
            println!();
            println!(
                "Sources ({}):",
                response.model_used.as_deref().unwrap_or("unknown model")
            );
            for (i, s) in response.sources.iter().enumerate() {
                println!(
                    "  [{}] {} chunk {} (score {:.3})",
                    i + 1,
                    s.document_id,
                    s.chunk_index,
                    s.score
                );
            }
        }
        _ => println!("Insufficient context to answer this question."),
    }
    Ok(())
}

pub async fn run_result(config: &Config, tenant: &str, document: &str, task: &str) -> Result<()> {
    let pipeline = crate::open_pipeline(config).await?;
    let view = pipeline
        .reviews()
        .effective(&TenantId::from(tenant), &DocumentId::from(document), task.parse()?)
        .await?;
    print_json(&view)
}

pub async fn run_review(
    config: &Config,
    tenant: &str,
    document: &str,
    task: &str,
    action: ReviewAction,
    user: &str,
) -> Result<()> {
    let pipeline = crate::open_pipeline(config).await?;
    let view = pipeline
        .reviews()
        .apply(
            &TenantId::from(tenant),
            &DocumentId::from(document),
            task.parse()?,
            &action,
            &UserId::from(user),
        )
        .await?;
    println!(
        "{} {} is now {}",
        document,
        task,
        view.result.review_state.as_str()
    );
    Ok(())
}

/// Accepts RFC 3339 timestamps or `YYYY-MM-DD`. A bare date means the
/// start of that day, or its last millisecond when `end_of_day` is set.
pub fn parse_time(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}': expected YYYY-MM-DD or RFC 3339", raw))?;
    let time = if end_of_day {
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| anyhow::anyhow!("invalid time of day"))?;
    Ok(date.and_time(time).and_utc())
}

pub async fn run_audit(
    config: &Config,
    tenant: &str,
    from: Option<String>,
    to: Option<String>,
    document: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    let query = AuditQuery {
        from: from.as_deref().map(|f| parse_time(f, false)).transpose()?,
        to: to.as_deref().map(|t| parse_time(t, true)).transpose()?,
        document_id: document.map(DocumentId::new),
        limit,
    };
    let pipeline = crate::open_pipeline(config).await?;
    let entries = pipeline
        .store
        .audit_log(&TenantId::from(tenant), &query)
        .await?;
    for e in &entries {
        println!(
            "{}  {:<18} {}{}{}",
            e.created_at.to_rfc3339(),
            e.action.to_string(),
            e.document_id
                .as_ref()
                .map(|d| format!("doc {} ", d))
                .unwrap_or_default(),
            e.job_id
                .as_ref()
                .map(|j| format!("job {} ", j))
                .unwrap_or_default(),
            e.details
        );
    }
    if entries.is_empty() {
        println!("No audit entries.");
    }
    Ok(())
}

pub async fn run_dlq_list(config: &Config, tenant: &str, limit: usize) -> Result<()> {
    let pipeline = crate::open_pipeline(config).await?;
    let letters = pipeline
        .dispatcher()
        .dead_letters(&TenantId::from(tenant), limit)
        .await?;
    print_json(&letters)
}

pub async fn run_dlq_replay(
    config: &Config,
    tenant: &str,
    dead_letter_id: &str,
    user: Option<String>,
) -> Result<()> {
    let pipeline = crate::open_pipeline(config).await?;
    let actor = user.map(UserId::new);
    let job = pipeline
        .dispatcher()
        .replay(&TenantId::from(tenant), dead_letter_id, actor.as_ref())
        .await?;
    println!("Replayed {} job {} as pending", job.task_type, job.job_id);
    Ok(())
}

/// Looks a job up by id, for `docflow job`.
pub async fn run_job(config: &Config, tenant: &str, job_id: &str) -> Result<()> {
    let pipeline = crate::open_pipeline(config).await?;
    let job = pipeline
        .dispatcher()
        .get_job(&TenantId::from(tenant), &JobId::from(job_id))
        .await?;
    print_json(&job)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_dates_cover_the_whole_day() {
        let from = parse_time("2024-03-01", false).unwrap();
        let to = parse_time("2024-03-01", true).unwrap();
        assert_eq!(from.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert!(to > from);
        assert_eq!((to - from).num_milliseconds(), 86_399_999);
        assert!(parse_time("2024-03-01T10:00:00Z", true).is_ok());
        assert!(parse_time("yesterday", false).is_err());
    }

    #[test]
    fn mime_types_follow_extensions() {
        assert_eq!(detect_mime_type(Path::new("a/Report.PDF")), "application/pdf");
        assert_eq!(detect_mime_type(Path::new("notes.md")), "text/markdown");
        assert_eq!(
            detect_mime_type(Path::new("blob")),
            "application/octet-stream"
        );
    }
}
