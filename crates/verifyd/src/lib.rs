//! verifyd - verification and retry engine
//!
//! Library components behind the `verifyd` binary: process capture,
//! transports, probing, execution, the retry orchestrator and the suite
//! scheduler.

pub mod assistant;
pub mod fakes;
pub mod orchestrator;
pub mod probe;
pub mod process;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod transcript;
pub mod transport;
pub mod workspace;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use assistant::{Assistant, AssistantError, CommandAssistant, SessionPool};
use orchestrator::{Orchestrator, PipelineError, RunRequest, RunSummary};
use scheduler::{CaseResult, Scheduler, SuiteCase, SuiteError};
use tracing::{debug, info};
use verify_core::config::ConfigError;
use verify_core::Config;

/// Project-local config file, relative to the working directory.
pub const LOCAL_CONFIG: &str = ".verify/config";

/// User-level config file (`~/.config/verify/config`).
pub fn user_config_path() -> Option<PathBuf> {
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(dirs::config_dir)?;
    Some(config_dir.join("verify").join("config"))
}

/// Layer config files: user file, then `.verify/config` under `cwd`, then
/// `explicit`. Later layers win; CLI flags are applied by the caller.
pub fn load_config(cwd: &Path, explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    let layers = [user_config_path(), Some(cwd.join(LOCAL_CONFIG))];
    for path in layers.into_iter().flatten() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            config.load_file(&path)?;
        }
    }
    if let Some(path) = explicit {
        debug!(path = %path.display(), "loading explicit config");
        config.load_file(path)?;
    }
    config.resolve_paths(cwd);
    Ok(config)
}

/// Engine state: one orchestrator plus the suite scheduler that shares it.
pub struct Engine {
    orchestrator: Orchestrator,
    scheduler: Arc<Scheduler>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("orchestrator", &self.orchestrator)
            .field("active_runs", &self.scheduler.active_run_count())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine around the configured assistant command.
    pub fn new(config: Config) -> Result<Self, AssistantError> {
        let assistant = CommandAssistant::from_config(&config)?;
        Ok(Self::with_assistant(config, Arc::new(assistant)))
    }

    pub fn with_assistant(config: Config, assistant: Arc<dyn Assistant>) -> Self {
        let pool = SessionPool::new(assistant, config.max_concurrent_runs);
        let orchestrator = Orchestrator::new(config, pool);
        let scheduler = Arc::new(Scheduler::with_defaults(orchestrator.clone()));
        Self {
            orchestrator,
            scheduler,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub async fn run_task(&self, request: RunRequest) -> Result<RunSummary, PipelineError> {
        info!(task = %request.task, "verifying task");
        self.orchestrator.run(request).await
    }

    pub async fn run_suite(&self, cases: &[SuiteCase]) -> Result<Vec<CaseResult>, SuiteError> {
        info!(
            cases = cases.len(),
            max_concurrent = self.scheduler.max_concurrent(),
            "running suite"
        );
        self.scheduler.run_suite(cases).await
    }

    /// Stop starting new suite waves.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.scheduler.shutdown();
    }
}
