//! Suite scheduler: runs a list of tasks as independent pipeline runs.
//!
//! Cases are grouped into dependency waves. Within a wave, runs execute
//! concurrently up to `max_concurrent_runs`. A case whose dependency did not
//! succeed is skipped. Cases in one dependency chain execute in the chain
//! root's programs dir so follow-up tasks observe earlier effects.

use crate::orchestrator::{Orchestrator, RunRequest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use verify_core::{Id, PipelineStatus, TargetSelection};

/// Default maximum concurrent runs.
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 3;

#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("failed to read suite file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid suite file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate case name: {0}")]
    DuplicateCase(String),
    #[error("case {case} depends on unknown case {dependency}")]
    UnknownDependency { case: String, dependency: String },
    #[error("dependency cycle involving: {0}")]
    Cycle(String),
    #[error("suite task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("scheduler shutdown")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, SuiteError>;

/// One entry of a suite file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteCase {
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub target: Option<TargetSelection>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Name of a case that must succeed first.
    #[serde(default)]
    pub depends_on: Option<String>,
}

/// Read a suite file: a JSON list of cases.
pub fn load_suite(path: &Path) -> Result<Vec<SuiteCase>> {
    let content = std::fs::read_to_string(path)?;
    let cases: Vec<SuiteCase> = serde_json::from_str(&content)?;
    waves(&cases)?;
    Ok(cases)
}

/// Group case indices into waves; every case comes after its dependency.
pub fn waves(cases: &[SuiteCase]) -> Result<Vec<Vec<usize>>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, case) in cases.iter().enumerate() {
        if index.insert(case.name.as_str(), i).is_some() {
            return Err(SuiteError::DuplicateCase(case.name.clone()));
        }
    }
    for case in cases {
        if let Some(dep) = &case.depends_on {
            if !index.contains_key(dep.as_str()) {
                return Err(SuiteError::UnknownDependency {
                    case: case.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut depth: Vec<Option<usize>> = vec![None; cases.len()];
    for start in 0..cases.len() {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = start;
        // Walk up to a case with a known depth or a root.
        let base = loop {
            if let Some(d) = depth[current] {
                break d + 1;
            }
            if !seen.insert(current) {
                return Err(SuiteError::Cycle(cases[current].name.clone()));
            }
            chain.push(current);
            match cases[current].depends_on.as_deref().and_then(|d| index.get(d)) {
                Some(&parent) => current = parent,
                None => break 0,
            }
        };
        for (offset, &i) in chain.iter().rev().enumerate() {
            depth[i] = Some(base + offset);
        }
    }

    let mut grouped: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, d) in depth.into_iter().enumerate() {
        grouped.entry(d.unwrap_or(0)).or_default().push(i);
    }
    Ok(grouped.into_values().collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
    /// Dependency did not pass; never started.
    Skipped,
    /// The run ended in a transport, assistant or internal error.
    Error,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub name: String,
    pub status: CaseStatus,
    pub run_id: Option<Id>,
    pub run_dir: Option<PathBuf>,
    pub attempts: u32,
    pub message: Option<String>,
    /// Programs dir follow-up cases execute in.
    #[serde(skip)]
    programs_dir: Option<PathBuf>,
    /// Remote work dir follow-up cases execute in.
    #[serde(skip)]
    remote_dir: Option<String>,
}

impl CaseResult {
    fn skipped(name: &str, dependency: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CaseStatus::Skipped,
            run_id: None,
            run_dir: None,
            attempts: 0,
            message: Some(format!("depends on {dependency}, which did not pass")),
            programs_dir: None,
            remote_dir: None,
        }
    }
}

/// Runs suites against one orchestrator.
pub struct Scheduler {
    orchestrator: Orchestrator,
    /// Semaphore for concurrency limiting.
    concurrency_semaphore: Arc<Semaphore>,
    /// Current number of active runs.
    active_runs: Arc<AtomicUsize>,
    max_concurrent: usize,
    shutdown: AtomicBool,
}

impl Scheduler {
    pub fn new(orchestrator: Orchestrator, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            orchestrator,
            concurrency_semaphore: Arc::new(Semaphore::new(max_concurrent)),
            active_runs: Arc::new(AtomicUsize::new(0)),
            max_concurrent,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Bound taken from the orchestrator's config.
    pub fn with_defaults(orchestrator: Orchestrator) -> Self {
        let max = orchestrator.config().max_concurrent_runs;
        Self::new(orchestrator, max)
    }

    pub fn active_run_count(&self) -> usize {
        self.active_runs.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn has_capacity(&self) -> bool {
        self.active_run_count() < self.max_concurrent
    }

    /// Stop starting new waves. Runs already started finish.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run every case. Results come back in suite order.
    pub async fn run_suite(&self, cases: &[SuiteCase]) -> Result<Vec<CaseResult>> {
        let plan = waves(cases)?;
        let has_dependents: HashSet<&str> = cases
            .iter()
            .filter_map(|c| c.depends_on.as_deref())
            .collect();
        let mut results: HashMap<String, CaseResult> = HashMap::new();

        for (wave_no, wave) in plan.iter().enumerate() {
            if self.is_shutdown() {
                return Err(SuiteError::Shutdown);
            }
            info!(wave = wave_no + 1, cases = wave.len(), "starting suite wave");
            let mut tasks = JoinSet::new();

            for &i in wave {
                let case = cases[i].clone();
                let (shared_programs, shared_remote_dir) = match case.depends_on.as_deref() {
                    Some(dep) => match results.get(dep) {
                        Some(parent) if parent.status == CaseStatus::Passed => {
                            (parent.programs_dir.clone(), parent.remote_dir.clone())
                        }
                        _ => {
                            warn!(case = %case.name, dependency = dep, "skipping: dependency did not pass");
                            results.insert(case.name.clone(), CaseResult::skipped(&case.name, dep));
                            continue;
                        }
                    },
                    None => (None, None),
                };
                let request = RunRequest {
                    task: case.task.clone(),
                    target: case.target,
                    max_retries: case.max_retries,
                    shared_programs,
                    shared_remote_dir,
                    keep_artifacts: case.depends_on.is_some() || has_dependents.contains(case.name.as_str()),
                };

                let orchestrator = self.orchestrator.clone();
                let semaphore = Arc::clone(&self.concurrency_semaphore);
                let active = Arc::clone(&self.active_runs);
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return case_error(&case.name, "scheduler shutdown".to_string());
                    };
                    active.fetch_add(1, Ordering::SeqCst);
                    let result = run_case(&orchestrator, &case, request).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    result
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let result = joined?;
                info!(
                    case = %result.name,
                    status = result.status.as_str(),
                    attempts = result.attempts,
                    "suite case finished"
                );
                results.insert(result.name.clone(), result);
            }
        }

        Ok(cases
            .iter()
            .filter_map(|c| results.remove(&c.name))
            .collect())
    }
}

async fn run_case(orchestrator: &Orchestrator, case: &SuiteCase, request: RunRequest) -> CaseResult {
    info!(case = %case.name, depends_on = ?case.depends_on, "suite case started");
    match orchestrator.run(request).await {
        Ok(summary) => {
            let status = if summary.run.status == PipelineStatus::Success {
                CaseStatus::Passed
            } else {
                CaseStatus::Failed
            };
            CaseResult {
                name: case.name.clone(),
                status,
                run_id: Some(summary.run.id.clone()),
                run_dir: Some(summary.layout.run_dir.clone()),
                attempts: u32::try_from(summary.run.attempts.len()).unwrap_or(u32::MAX),
                message: summary.reason,
                programs_dir: Some(summary.layout.programs_dir),
                remote_dir: summary
                    .run
                    .target
                    .is_remote()
                    .then(|| summary.run.target.work_dir.clone()),
            }
        }
        Err(err) => {
            warn!(case = %case.name, error = %err, "suite case errored");
            case_error(&case.name, err.to_string())
        }
    }
}

fn case_error(name: &str, message: String) -> CaseResult {
    CaseResult {
        name: name.to_string(),
        status: CaseStatus::Error,
        run_id: None,
        run_dir: None,
        attempts: 0,
        message: Some(message),
        programs_dir: None,
        remote_dir: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::SessionPool;
    use crate::fakes::ScriptedAssistant;
    use tempfile::TempDir;
    use verify_core::Config;

    fn case(name: &str, task: &str, depends_on: Option<&str>) -> SuiteCase {
        SuiteCase {
            name: name.to_string(),
            task: task.to_string(),
            target: Some(TargetSelection::Local),
            max_retries: Some(0),
            depends_on: depends_on.map(str::to_string),
        }
    }

    fn scheduler(root: &TempDir, replies: &[&str], max: usize) -> Scheduler {
        let config = Config {
            workspace_root: root.path().join("runs"),
            probe_context: false,
            response_timeout_sec: 5,
            ..Config::default()
        };
        let pool = SessionPool::new(Arc::new(ScriptedAssistant::new(replies.iter().copied())), max);
        Scheduler::new(Orchestrator::new(config, pool), max)
    }

    #[test]
    fn waves_follow_dependencies() {
        let cases = vec![
            case("create", "t", None),
            case("other", "t", None),
            case("delete", "t", Some("create")),
            case("verify", "t", Some("delete")),
        ];
        assert_eq!(waves(&cases).unwrap(), vec![vec![0, 1], vec![2], vec![3]]);
    }

    #[test]
    fn waves_reject_bad_graphs() {
        let unknown = vec![case("a", "t", Some("missing"))];
        assert!(matches!(
            waves(&unknown),
            Err(SuiteError::UnknownDependency { .. })
        ));

        let cycle = vec![case("a", "t", Some("b")), case("b", "t", Some("a"))];
        assert!(matches!(waves(&cycle), Err(SuiteError::Cycle(_))));

        let dup = vec![case("a", "t", None), case("a", "t", None)];
        assert!(matches!(waves(&dup), Err(SuiteError::DuplicateCase(_))));
    }

    #[test]
    fn load_suite_parses_optional_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("suite.json");
        std::fs::write(
            &path,
            r#"[
                {"name": "create", "task": "create a folder", "target": "local"},
                {"name": "delete", "task": "delete it", "depends_on": "create", "max_retries": 1}
            ]"#,
        )
        .unwrap();
        let cases = load_suite(&path).unwrap();
        assert_eq!(cases[0].target, Some(TargetSelection::Local));
        assert_eq!(cases[1].depends_on.as_deref(), Some("create"));
        assert_eq!(cases[1].max_retries, Some(1));
    }

    #[tokio::test]
    async fn failed_dependency_skips_dependent() {
        let root = TempDir::new().unwrap();
        let scheduler = scheduler(&root, &["no code at all"], 2);
        let results = scheduler
            .run_suite(&[case("first", "print hello", None), case("second", "print bye", Some("first"))])
            .await
            .unwrap();

        assert_eq!(results[0].status, CaseStatus::Failed);
        assert_eq!(results[1].status, CaseStatus::Skipped);
        assert_eq!(scheduler.active_run_count(), 0);
    }

    #[tokio::test]
    async fn chain_shares_programs_dir() {
        let root = TempDir::new().unwrap();
        let scheduler = scheduler(
            &root,
            &[
                "```bash\necho hi > shared.txt\n```",
                "```bash\ntest -f shared.txt\n```",
            ],
            1,
        );
        let results = scheduler
            .run_suite(&[
                case("make", "print hello", None),
                case("check", "print hello again", Some("make")),
            ])
            .await
            .unwrap();

        assert_eq!(results[0].status, CaseStatus::Passed);
        assert_eq!(results[1].status, CaseStatus::Passed, "{:?}", results[1].message);
        assert_eq!(results[0].programs_dir, results[1].programs_dir);
    }

    #[tokio::test]
    async fn shutdown_stops_before_next_wave() {
        let root = TempDir::new().unwrap();
        let scheduler = scheduler(&root, &[], 1);
        scheduler.shutdown();
        let err = scheduler
            .run_suite(&[case("a", "print hello", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, SuiteError::Shutdown));
    }
}
