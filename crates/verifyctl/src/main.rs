//! verifyctl - inspect verification runs
//!
//! Offline companion to verifyd: lists and shows stored runs, and previews
//! how a reply would be classified or which tests a task would get.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod render;
mod runs;

use std::io::Read;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use runs::{CtlError, Result};
use verify_core::acceptance::{self, GenerateOptions};
use verify_core::{classify_all, extract, intent, Config, PipelineRun, PipelineStatus, RemoteHost, Target};

/// Project-local config file, relative to the workspace root.
const LOCAL_CONFIG: &str = ".verify/config";

#[derive(Parser)]
#[command(name = "verifyctl")]
#[command(about = "Inspect verification runs and preview classification")]
#[command(version)]
struct Cli {
    /// Config file layered over .verify/config
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root for run directories (overrides config)
    #[arg(long, global = true, env = "VERIFY_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List stored runs, newest first
    List {
        /// Only runs with this status (running, success, failed, done)
        #[arg(long, value_parser = parse_status)]
        status: Option<PipelineStatus>,
    },

    /// Show a run: attempts, verdicts and event report
    Show {
        /// Run id, unique id prefix, run directory, or "latest"
        run: String,

        /// Skip the event report
        #[arg(long)]
        no_events: bool,
    },

    /// Classify the code blocks of a saved assistant reply
    Classify {
        /// Reply file, or "-" for stdin
        file: PathBuf,

        /// Task the reply answers (enables contradiction checks)
        #[arg(long, default_value = "")]
        task: String,
    },

    /// Preview the acceptance tests generated for a task
    Tests {
        /// Task description in natural language
        task: String,

        #[arg(short, long, value_enum, default_value = "local")]
        target: TargetArg,

        /// Remote host (defaults to remote_host from config)
        #[arg(long)]
        host: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetArg {
    Local,
    Remote,
}

fn parse_status(s: &str) -> std::result::Result<PipelineStatus, String> {
    match s.to_ascii_lowercase().as_str() {
        "running" => Ok(PipelineStatus::Running),
        "success" => Ok(PipelineStatus::Success),
        "failed" => Ok(PipelineStatus::Failed),
        "done" => Ok(PipelineStatus::Done),
        _ => Err(format!(
            "invalid status '{s}': expected running, success, failed or done"
        )),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let root = find_workspace_root()?;
    let mut config = load_workspace_config(&root, cli.config.as_deref())?;
    if let Some(workspace_root) = cli.workspace_root {
        config.workspace_root = workspace_root;
        config.resolve_paths(&root);
    }

    match cli.command {
        Command::List { status } => {
            let stored = runs::list_runs(&config.workspace_root, status)?;
            render::print_run_list(&stored);
        }
        Command::Show { run, no_events } => {
            let stored = if run == "latest" {
                runs::latest_run(&config.workspace_root)?
            } else {
                runs::find_run(&config.workspace_root, &run)?
            };
            let report = if no_events { Vec::new() } else { stored.report()? };
            render::print_run_details(&stored, &report);
        }
        Command::Classify { file, task } => {
            let reply = read_input(&file)?;
            let extraction = extract(&reply);
            let classification = classify_all(&task, &extraction.blocks);
            render::print_classification(&task, &extraction, &classification);
        }
        Command::Tests { task, target, host } => {
            let preview = preview_run(&config, &task, target, host)?;
            let tests = acceptance::generate(
                &task,
                &preview.target,
                GenerateOptions {
                    stability_delay_sec: config.stability_delay_sec,
                },
            );
            render::print_tests(&preview, &tests);
        }
    }
    Ok(())
}

/// Git toplevel when inside a repository, else the current directory.
fn find_workspace_root() -> Result<PathBuf> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .output();

    match output {
        Ok(out) if out.status.success() => {
            let path = String::from_utf8_lossy(&out.stdout).trim().to_string();
            Ok(PathBuf::from(path))
        }
        _ => Ok(std::env::current_dir()?),
    }
}

fn load_workspace_config(workspace_root: &Path, config_override: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();
    let project_config = workspace_root.join(LOCAL_CONFIG);
    if project_config.exists() {
        config.load_file(&project_config)?;
    }

    if let Some(override_path) = config_override {
        if !override_path.exists() {
            return Err(CtlError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config override not found: {}", override_path.display()),
            )));
        }
        config.load_file(override_path)?;
    }

    config.resolve_paths(workspace_root);
    Ok(config)
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    Ok(std::fs::read_to_string(path)?)
}

/// An unstarted run carrying the target a real run would use.
fn preview_run(
    config: &Config,
    task: &str,
    target: TargetArg,
    host: Option<String>,
) -> Result<PipelineRun> {
    let target = match target {
        TargetArg::Local => {
            let programs = config.workspace_root.join("run-<id>").join("programs");
            Target::local(programs.display().to_string())
        }
        TargetArg::Remote => {
            let host = host
                .or_else(|| config.remote_host.clone())
                .unwrap_or_else(|| "<remote-host>".to_string());
            let remote = RemoteHost {
                host,
                user: config.remote_user.clone(),
                port: config.remote_port,
            };
            let work_dir = format!("{}/run-<id>", config.remote_dir.trim_end_matches('/'));
            Target::remote(remote, work_dir)
        }
    };
    Ok(PipelineRun::new(
        task,
        target,
        intent::detect_intent(task),
        config.max_retries,
    ))
}
