//! # Docflow
//!
//! A multi-tenant document-processing pipeline with retrieval-augmented
//! question answering and a human review workflow.
//!
//! Uploaded documents flow through independent processing stages (OCR,
//! extraction, summarization, indexing, form filling), each driven by a
//! durable job queue with leases, retries, and a dead-letter channel.
//! Indexed chunks back grounded answers; stored results go through
//! correction and validation by reviewers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────────┐   ┌──────────┐
//! │  Upload  │──▶│  Queue   │──▶│   Workers    │──▶│  SQLite  │
//! │ CLI/HTTP │   │  leases  │   │ OCR/Extract/ │   │ results  │
//! └──────────┘   │  + DLQ   │   │ Summ/Index   │   │ chunks   │
//!                └──────────┘   └──────────────┘   └────┬─────┘
//!                                                       │
//!                              ┌────────────────────────┤
//!                              ▼                        ▼
//!                         ┌──────────┐            ┌──────────┐
//!                         │  Query   │            │  Review  │
//!                         │  (RAG)   │            │ workflow │
//!                         └──────────┘            └──────────┘
//! ```
//!
//! Runtime-independent logic (state machines, chunking, retrieval, review)
//! lives in `docflow-core`. This crate supplies persistence, providers, the
//! worker runner, the HTTP server, and the CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! docflow init
//! docflow upload acme ./invoice.pdf --user alice
//! docflow enqueue acme <document-id> ocr
//! docflow work --once
//! docflow query acme "What is the invoice total?"
//! docflow serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection and error mapping |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite-backed structured store |
//! | [`sqlite_queue`] | SQLite-backed job queue |
//! | [`blob_fs`] | Filesystem object store |
//! | [`providers`] | Embedding, generation, and text recognition backends |
//! | [`runner`] | Worker pool for `docflow work` |
//! | [`commands`] | CLI command implementations |
//! | [`server`] | HTTP API |

pub mod blob_fs;
pub mod commands;
pub mod config;
pub mod db;
pub mod migrate;
pub mod providers;
pub mod runner;
pub mod server;
pub mod sqlite_queue;
pub mod sqlite_store;

use std::sync::Arc;

use anyhow::Result;
use docflow_core::primitives::Primitives;
use docflow_core::Pipeline;

use crate::blob_fs::FsBlobStore;
use crate::config::Config;
use crate::sqlite_queue::SqliteQueue;
use crate::sqlite_store::SqliteStore;

/// Connect, migrate, and wire the pipeline with the configured providers.
pub async fn open_pipeline(config: &Config) -> Result<Pipeline> {
    let primitives = providers::create_primitives(config)?;
    open_pipeline_with(config, primitives).await
}

/// Like [`open_pipeline`] with caller-supplied primitives.
pub async fn open_pipeline_with(config: &Config, primitives: Primitives) -> Result<Pipeline> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    Ok(Pipeline::new(
        Arc::new(SqliteStore::new(pool.clone())),
        Arc::new(SqliteQueue::new(pool)),
        Arc::new(FsBlobStore::new(&config.blobs.root)),
        primitives,
        config.to_settings()?,
    ))
}
