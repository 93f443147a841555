//! Worker runner for `docflow work`.
//!
//! Spawns `concurrency` workers per task type into a [`JoinSet`]. Workers
//! share nothing but the pipeline handles; coordination is entirely
//! through queue leases. Each worker polls while idle, stops on ctrl-c,
//! and in `--once` mode stops as soon as its task type has no visible job.
//!
//! A worker that hits a fatal error (tenant isolation) halts on its own.
//! The others keep running and the failure is reported when the runner
//! returns.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;

use docflow_core::models::TaskType;
use docflow_core::worker::WorkerStep;
use docflow_core::Pipeline;

use crate::config::Config;

/// Consecutive non-fatal errors a `--once` worker tolerates before giving
/// up on a drain.
const ONCE_ERROR_LIMIT: u32 = 10;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Task types to work on; empty means all of them.
    pub tasks: Vec<TaskType>,
    /// Drain visible jobs and exit instead of polling forever.
    pub once: bool,
    /// Overrides `[tasks.<task>].concurrency` for every task type.
    pub concurrency: Option<usize>,
}

/// Steps taken per task type.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Tally {
    pub acked: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
}

impl Tally {
    fn record(&mut self, step: WorkerStep) {
        match step {
            WorkerStep::Acked => self.acked += 1,
            WorkerStep::Retrying => self.retrying += 1,
            WorkerStep::DeadLettered => self.dead_lettered += 1,
            WorkerStep::Skipped => self.skipped += 1,
            WorkerStep::Idle => {}
        }
    }

    fn merge(&mut self, other: &Tally) {
        self.acked += other.acked;
        self.retrying += other.retrying;
        self.dead_lettered += other.dead_lettered;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub tasks: BTreeMap<TaskType, Tally>,
    /// Workers that halted, with the error that stopped them.
    pub halted: Vec<String>,
}

struct WorkerExit {
    task_type: TaskType,
    tally: Tally,
    halted: Option<String>,
}

/// Run workers until ctrl-c (or, with `once`, until the queue drains).
pub async fn run_workers(pipeline: Pipeline, config: &Config, options: RunOptions) -> Result<RunReport> {
    let tasks = if options.tasks.is_empty() {
        TaskType::ALL.to_vec()
    } else {
        options.tasks.clone()
    };
    let poll = config.queue.poll_interval();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested; finishing in-flight jobs");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut set = JoinSet::new();
    for task_type in tasks {
        let concurrency = options
            .concurrency
            .unwrap_or_else(|| config.task(task_type).concurrency)
            .max(1);
        for n in 0..concurrency {
            let worker_id = format!("{}-{}", task_type, n);
            set.spawn(work_loop(
                pipeline.clone(),
                worker_id,
                task_type,
                poll,
                options.once,
                shutdown_rx.clone(),
            ));
        }
        tracing::info!(task_type = %task_type, concurrency, "workers started");
    }

    let mut report = RunReport::default();
    while let Some(joined) = set.join_next().await {
        let exit = match joined {
            Ok(exit) => exit,
            Err(e) => bail!("worker task panicked: {}", e),
        };
        report
            .tasks
            .entry(exit.task_type)
            .or_default()
            .merge(&exit.tally);
        if let Some(reason) = exit.halted {
            report.halted.push(reason);
        }
    }
    Ok(report)
}

async fn work_loop(
    pipeline: Pipeline,
    worker_id: String,
    task_type: TaskType,
    poll: Duration,
    once: bool,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerExit {
    let worker = pipeline.worker(worker_id.clone());
    let mut tally = Tally::default();
    let mut errors = 0u32;

    let halted = loop {
        if *shutdown.borrow() {
            break None;
        }
        let idle = match worker.process_one(task_type).await {
            Ok(WorkerStep::Idle) => {
                errors = 0;
                if once {
                    break None;
                }
                true
            }
            Ok(step) => {
                errors = 0;
                tally.record(step);
                false
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(worker = %worker_id, error = %e, "worker halted");
                break Some(format!("{}: {}", worker_id, e));
            }
            Err(e) => {
                errors += 1;
                tracing::warn!(worker = %worker_id, error = %e, errors, "worker step failed");
                if once && errors >= ONCE_ERROR_LIMIT {
                    break Some(format!("{}: gave up after {} errors: {}", worker_id, errors, e));
                }
                true
            }
        };
        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.changed() => {}
            }
        }
    };

    WorkerExit {
        task_type,
        tally,
        halted,
    }
}
