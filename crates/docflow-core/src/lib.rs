//! # Docflow Core
//!
//! Runtime-independent logic for docflow: data models, the error taxonomy,
//! the job-queue and store contracts, the worker state machine, chunking,
//! summarization and extraction helpers, retrieval, and the review
//! workflow.
//!
//! This crate contains no sqlx, HTTP clients, or filesystem I/O. The
//! `docflow` app crate supplies SQLite-backed [`store::Store`] and
//! [`queue::JobQueue`] implementations plus concrete primitives; the
//! in-memory implementations here back the unit tests.

pub mod blob;
pub mod chunk;
pub mod dispatcher;
pub mod embedding;
pub mod error;
pub mod extraction;
pub mod handlers;
pub mod intake;
pub mod models;
pub mod pipeline;
pub mod primitives;
pub mod queue;
pub mod results;
pub mod retrieval;
pub mod review;
pub mod settings;
pub mod store;
pub mod summarize;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod worker;

pub use error::{FailureClass, PipelineError, Result};
pub use pipeline::Pipeline;
