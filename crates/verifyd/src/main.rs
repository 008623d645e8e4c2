//! verifyd - verification and retry engine
//!
//! Main entry point: verify one task, or run a suite file.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use eyre::WrapErr;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use verify_core::{Config, PipelineStatus, TargetSelection};
use verifyd::orchestrator::{RunRequest, RunSummary};
use verifyd::scheduler::{self, CaseResult, CaseStatus};
use verifyd::{load_config, Engine};

#[derive(Parser)]
#[command(name = "verifyd", about = "Generate, execute and verify code against a target", version)]
struct Cli {
    /// Config file layered over .verify/config
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root for run directories
    #[arg(long, global = true)]
    workspace_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify a single task
    Run {
        /// Task description in natural language
        task: String,
        #[arg(short, long, value_enum)]
        target: Option<TargetArg>,
        /// Remote host (implies a configured remote target)
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Stop after classification without executing anything
        #[arg(long)]
        no_run: bool,
    },
    /// Run every case of a suite file (JSON list)
    Suite {
        file: PathBuf,
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetArg {
    Auto,
    Local,
    Remote,
}

impl From<TargetArg> for TargetSelection {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Auto => Self::Auto,
            TargetArg::Local => Self::Local,
            TargetArg::Remote => Self::Remote,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> eyre::Result<ExitCode> {
    let cwd = std::env::current_dir().wrap_err("cannot read current directory")?;
    let mut config = load_config(&cwd, cli.config.as_deref()).wrap_err("failed to load config")?;
    if let Some(root) = cli.workspace_root {
        config.workspace_root = root;
        config.resolve_paths(&cwd);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    match cli.command {
        Command::Run {
            task,
            target,
            host,
            user,
            max_retries,
            no_run,
        } => {
            apply_run_flags(&mut config, host, user, no_run);
            let engine = Engine::new(config).wrap_err("cannot start assistant")?;
            let request = RunRequest {
                target: target.map(Into::into),
                max_retries,
                ..RunRequest::new(task)
            };
            runtime.block_on(async {
                tokio::select! {
                    result = engine.run_task(request) => {
                        let summary = result?;
                        print_summary(&summary);
                        Ok::<_, eyre::Report>(exit_for(summary.run.status))
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("received SIGINT, abandoning run");
                        Ok(ExitCode::from(130))
                    }
                }
            })
        }
        Command::Suite {
            file,
            max_concurrent,
        } => {
            if let Some(max) = max_concurrent {
                config.max_concurrent_runs = max;
            }
            let cases = scheduler::load_suite(&file)
                .wrap_err_with(|| format!("failed to load suite {}", file.display()))?;
            let engine = Engine::new(config).wrap_err("cannot start assistant")?;
            runtime.block_on(async {
                let engine_ref = &engine;
                tokio::select! {
                    result = engine.run_suite(&cases) => {
                        let results = result?;
                        print_suite(&results);
                        let all_passed = results.iter().all(|r| r.status == CaseStatus::Passed);
                        Ok::<_, eyre::Report>(if all_passed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("received SIGINT, stopping suite");
                        engine_ref.shutdown();
                        Ok(ExitCode::from(130))
                    }
                }
            })
        }
    }
}

/// CLI flags win over every config layer.
fn apply_run_flags(config: &mut Config, host: Option<String>, user: Option<String>, no_run: bool) {
    if host.is_some() {
        config.remote_host = host;
    }
    if user.is_some() {
        config.remote_user = user;
    }
    if no_run {
        config.execute = false;
    }
}

fn exit_for(status: PipelineStatus) -> ExitCode {
    match status {
        PipelineStatus::Success | PipelineStatus::Done => ExitCode::SUCCESS,
        PipelineStatus::Failed | PipelineStatus::Running => ExitCode::FAILURE,
    }
}

fn print_summary(summary: &RunSummary) {
    let run = &summary.run;
    println!("run:      {}", run.id);
    println!("status:   {}", run.status.as_str());
    println!("target:   {} ({})", run.target.describe(), run.target.work_dir);
    println!("attempts: {}/{}", run.attempts.len(), run.max_attempts());
    if let Some(reason) = &summary.reason {
        println!("reason:   {reason}");
    }
    let files = run.files_touched();
    if !files.is_empty() {
        println!("files:    {}", files.join(", "));
    }
    println!("record:   {}", summary.layout.run_dir.display());
}

fn print_suite(results: &[CaseResult]) {
    for result in results {
        println!(
            "{:<8} {:<24} attempts={} {}",
            result.status.as_str().to_uppercase(),
            result.name,
            result.attempts,
            result.message.as_deref().unwrap_or("")
        );
    }
    let passed = results.iter().filter(|r| r.status == CaseStatus::Passed).count();
    println!("{passed}/{} passed", results.len());
}
