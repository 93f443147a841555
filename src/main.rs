//! # Docflow CLI (`docflow`)
//!
//! The `docflow` binary drives the pipeline: upload documents, enqueue
//! processing tasks, run workers, ask questions, review results, and serve
//! the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! docflow --config ./config/docflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docflow init` | Create the database, run migrations, create the blob root |
//! | `docflow upload <tenant> <file>` | Store a document |
//! | `docflow enqueue <tenant> <doc> <task>` | Queue a processing task |
//! | `docflow status <tenant> <doc>` | Show a document and its task states |
//! | `docflow job <tenant> <job>` | Show a job |
//! | `docflow work` | Run workers |
//! | `docflow query <tenant> "<question>"` | Grounded question answering |
//! | `docflow result <tenant> <doc> <task>` | Show a stored result with corrections |
//! | `docflow review ...` | Correct, mark reviewed, validate, or reject a result |
//! | `docflow audit <tenant>` | Read the audit log |
//! | `docflow dlq list\|replay` | Inspect and replay dead letters |
//! | `docflow serve` | Start the HTTP API |
//!
//! Logging goes to stderr. The filter comes from `DOCFLOW_LOG`, then
//! `-v`/`-q`, then `[logging].filter` in the config.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docflow::commands;
use docflow::config::{self, Config};
use docflow::runner::RunOptions;
use docflow_core::models::TaskType;
use docflow_core::review::ReviewAction;

/// Docflow: multi-tenant document processing with grounded retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docflow.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docflow",
    about = "Docflow: a queue-driven document processing pipeline with grounded retrieval",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docflow.toml")]
    config: PathBuf,

    /// Verbose logging (debug). Overridden by DOCFLOW_LOG.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and blob directory.
    ///
    /// Idempotent: already-applied migrations are skipped.
    Init,

    /// Upload a document for a tenant.
    Upload {
        tenant: String,
        /// File to upload.
        path: PathBuf,
        /// Uploading user.
        #[arg(long, default_value = "cli")]
        user: String,
        /// MIME type; guessed from the extension when omitted.
        #[arg(long)]
        mime: Option<String>,
    },

    /// Enqueue a processing task for a document.
    ///
    /// Tasks: ocr, extraction, summarization, indexing, form_filling.
    Enqueue {
        tenant: String,
        document: String,
        task: String,
        /// Task payload as a JSON object, e.g. '{"template":"invoice"}'.
        #[arg(long)]
        payload: Option<String>,
    },

    /// Show a document and the state of each of its tasks.
    Status { tenant: String, document: String },

    /// Show a processing job.
    Job { tenant: String, job: String },

    /// Run workers.
    ///
    /// Without `--once`, runs until ctrl-c, polling each task queue.
    Work {
        /// Task types to work on (repeatable). Defaults to all.
        #[arg(long = "task")]
        tasks: Vec<String>,
        /// Exit once every selected queue has no visible job.
        #[arg(long)]
        once: bool,
        /// Workers per task type, overriding `[tasks.<task>].concurrency`.
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Answer a question from a tenant's indexed documents.
    Query {
        tenant: String,
        question: String,
        /// Restrict retrieval to these documents (repeatable).
        #[arg(long = "document")]
        documents: Vec<String>,
        /// Number of chunks to retrieve.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Show a stored result with its review overlay.
    Result {
        tenant: String,
        document: String,
        task: String,
    },

    /// Review a stored result.
    Review {
        tenant: String,
        document: String,
        task: String,
        /// Reviewing user.
        #[arg(long)]
        user: String,
        #[command(subcommand)]
        action: ReviewCommand,
    },

    /// Read the audit log, oldest first.
    Audit {
        tenant: String,
        /// Start of range (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        from: Option<String>,
        /// End of range, inclusive (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        document: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Inspect and replay dead letters.
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum ReviewCommand {
    /// Override one field's value.
    Correct {
        field: String,
        /// New value as JSON; bare words are taken as strings.
        value: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Mark the result reviewed.
    MarkReviewed {
        #[arg(long)]
        note: Option<String>,
    },
    /// Validate the result. Frozen afterwards.
    Validate {
        #[arg(long)]
        note: Option<String>,
    },
    /// Reject the result.
    Reject { reason: String },
}

impl ReviewCommand {
    fn into_action(self) -> ReviewAction {
        match self {
            ReviewCommand::Correct { field, value, note } => ReviewAction::Correct {
                field,
                value: serde_json::from_str(&value)
                    .unwrap_or(serde_json::Value::String(value)),
                note,
            },
            ReviewCommand::MarkReviewed { note } => ReviewAction::MarkReviewed { note },
            ReviewCommand::Validate { note } => ReviewAction::Validate { note },
            ReviewCommand::Reject { reason } => ReviewAction::Reject { reason },
        }
    }
}

#[derive(Subcommand)]
enum DlqAction {
    /// List dead letters, newest first.
    List {
        tenant: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Return a dead-lettered job to the queue.
    Replay {
        tenant: String,
        dead_letter_id: String,
        #[arg(long)]
        user: Option<String>,
    },
}

fn init_tracing(cli: &Cli, config: Option<&Config>) {
    let filter = match std::env::var("DOCFLOW_LOG") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) if cli.verbose => EnvFilter::new("debug"),
        Err(_) if cli.quiet => EnvFilter::new("warn"),
        Err(_) => EnvFilter::new(
            config
                .map(|c| c.logging.filter.as_str())
                .unwrap_or("info"),
        ),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing(&cli, None);
            return Err(e);
        }
    };
    init_tracing(&cli, Some(&cfg));

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Upload {
            tenant,
            path,
            user,
            mime,
        } => commands::run_upload(&cfg, &tenant, &path, &user, mime).await?,
        Commands::Enqueue {
            tenant,
            document,
            task,
            payload,
        } => commands::run_enqueue(&cfg, &tenant, &document, &task, payload).await?,
        Commands::Status { tenant, document } => {
            commands::run_status(&cfg, &tenant, &document).await?
        }
        Commands::Job { tenant, job } => commands::run_job(&cfg, &tenant, &job).await?,
        Commands::Work {
            tasks,
            once,
            concurrency,
        } => {
            let tasks = tasks
                .iter()
                .map(|t| t.parse::<TaskType>())
                .collect::<Result<Vec<_>, _>>()?;
            commands::run_work(
                &cfg,
                RunOptions {
                    tasks,
                    once,
                    concurrency,
                },
            )
            .await?
        }
        Commands::Query {
            tenant,
            question,
            documents,
            top_k,
        } => commands::run_query(&cfg, &tenant, &question, documents, top_k).await?,
        Commands::Result {
            tenant,
            document,
            task,
        } => commands::run_result(&cfg, &tenant, &document, &task).await?,
        Commands::Review {
            tenant,
            document,
            task,
            user,
            action,
        } => {
            commands::run_review(&cfg, &tenant, &document, &task, action.into_action(), &user)
                .await?
        }
        Commands::Audit {
            tenant,
            from,
            to,
            document,
            limit,
        } => commands::run_audit(&cfg, &tenant, from, to, document, limit).await?,
        Commands::Dlq { action } => match action {
            DlqAction::List { tenant, limit } => {
                commands::run_dlq_list(&cfg, &tenant, limit).await?
            }
            DlqAction::Replay {
                tenant,
                dead_letter_id,
                user,
            } => commands::run_dlq_replay(&cfg, &tenant, &dead_letter_id, user).await?,
        },
        Commands::Serve => docflow::server::run_server(&cfg).await?,
    }

    Ok(())
}
