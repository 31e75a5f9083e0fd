// Entry point for the CDS worker step engine.
//
// `cds-worker run --job <file|->` executes the steps of one job described in
// JSON and exits 0 when every step succeeded, 1 otherwise. Ctrl-C cancels the
// running step.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use worker_common::{logging, WorkerSettings};
use worker_engine::builtin;
use worker_engine::log_funnel::{ApiLogSink, LogSink, StdoutLogSink};
use worker_engine::{JobRunner, JobSpec, StepExecutor};

#[derive(Parser, Debug)]
#[command(name = "cds-worker", version, about = "CDS worker step engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute the steps of a job.
    Run(RunArgs),
    /// List the builtin actions.
    Builtins,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Job file (JSON), or `-` to read it from stdin.
    #[arg(long)]
    job: String,

    /// Directory holding staged plugin binaries.
    #[arg(long)]
    plugin_dir: Option<PathBuf>,

    /// Root of the local artifact store.
    #[arg(long)]
    artifact_dir: Option<PathBuf>,

    /// Send step logs to the worker API instead of stdout.
    #[arg(long)]
    api_logs: bool,

    /// Emit diagnostics as JSON.
    #[arg(long)]
    log_json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async move {
        match cli.command {
            Command::Run(args) => run(args).await,
            Command::Builtins => {
                for name in builtin::default_registry().names() {
                    println!("{name}");
                }
                Ok(0)
            }
        }
    });

    match result {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("Worker failed: {e:#}");
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: RunArgs) -> Result<u8> {
    let mut settings = WorkerSettings::from_env().context("Invalid worker configuration")?;
    if let Some(dir) = args.plugin_dir {
        settings.plugin_dir = dir;
    }
    if let Some(dir) = args.artifact_dir {
        settings.artifact_dir = dir;
    }
    settings.log_json |= args.log_json;
    logging::init(settings.log_json);

    tracing::info!(
        worker = %settings.worker_name,
        plugin_dir = %settings.plugin_dir.display(),
        tls_skip_verify = settings.tls_skip_verify,
        "Worker starting"
    );

    let spec = read_job(&args.job)?;
    let registry = builtin::install(builtin::default_registry());
    let sink: Arc<dyn LogSink> = if args.api_logs {
        Arc::new(ApiLogSink::new(&settings)?)
    } else {
        Arc::new(StdoutLogSink)
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            tracing::warn!("Interrupt received, canceling the job");
            cancel.cancel();
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    let runner = JobRunner::new(StepExecutor::new(Arc::new(settings), registry, sink));
    let report = runner.run(&spec, &cancel).await;
    Ok(u8::try_from(report.exit_code()).unwrap_or(1))
}

fn read_job(source: &str) -> Result<JobSpec> {
    let raw = if source == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("Failed to read job from stdin")?;
        raw
    } else {
        std::fs::read_to_string(source).with_context(|| format!("Failed to read job file {source}"))?
    };
    serde_json::from_str(&raw).context("Invalid job description")
}
