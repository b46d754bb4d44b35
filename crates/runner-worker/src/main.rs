// Entry point for the worker process.
//
// Runs the job described by `--job-file` to completion and exits with a
// return code that encodes the job's `TaskResult`.

use anyhow::{Context, Result};
use clap::Parser;
use runner_common::host_context::HostContext;
use runner_common::util::task_result_util::{TaskResult, TaskResultUtil};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use runner_worker::services::WorkerServices;
use runner_worker::worker::Worker;

/// Command-line arguments for the worker process.
#[derive(Parser, Debug)]
#[command(name = "Runner.Worker", about = "Runs a single workflow job")]
struct Args {
    /// JSON job message to run.
    #[arg(long = "job-file")]
    job_file: PathBuf,

    /// Root of the runner's work directory.
    #[arg(long = "work-dir", default_value = "_work")]
    work_dir: PathBuf,

    /// Where downloaded actions live. Defaults to `<work-dir>/_actions`.
    #[arg(long = "actions-dir")]
    actions_dir: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt().with_env_filter(log_filter()).init();

    let exit_code = match run(args) {
        Ok(result) => {
            let return_code = TaskResultUtil::translate_to_return_code(result);
            tracing::info!(
                "Worker completed with result {} (return code {})",
                result,
                return_code
            );
            return_code
        }
        Err(e) => {
            tracing::error!("Worker failed with error: {:#}", e);
            TaskResultUtil::translate_to_return_code(TaskResult::Failed)
        }
    };

    std::process::exit(exit_code);
}

/// `RUST_LOG` when set, otherwise `info`.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn run(args: Args) -> Result<TaskResult> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    runtime.block_on(async move {
        tracing::info!("Worker process starting.");
        tracing::info!("  job file = {}", args.job_file.display());
        tracing::info!("  work dir = {}", args.work_dir.display());

        let host = match args.actions_dir {
            Some(actions) => HostContext::with_actions_directory(&args.work_dir, actions),
            None => HostContext::new(&args.work_dir),
        };

        let shutdown_host = Arc::clone(&host);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl-C, cancelling the job.");
                shutdown_host.shutdown();
            }
        });

        let services = Arc::new(WorkerServices::new(host));
        Worker::new(services).run_async(&args.job_file).await
    })
}
