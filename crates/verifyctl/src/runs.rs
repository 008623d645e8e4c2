//! Read-only access to run directories under the workspace root.

use std::path::{Path, PathBuf};

use thiserror::Error;
use verify_core::record::RecordError;
use verify_core::report::read_report;
use verify_core::{PipelineStatus, ReportRow, RunRecord};

#[derive(Debug, Error)]
pub enum CtlError {
    #[error("run not found: {0}\n  → list runs with: verifyctl list")]
    RunNotFound(String),

    #[error("run id {prefix} is ambiguous ({count} matches)")]
    Ambiguous { prefix: String, count: usize },

    #[error("{path}: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: RecordError,
    },

    #[error("config error: {0}")]
    Config(#[from] verify_core::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CtlError>;

/// A run directory with its parsed record.
#[derive(Debug, Clone)]
pub struct StoredRun {
    pub dir: PathBuf,
    pub record: RunRecord,
}

impl StoredRun {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("run.json");
        let record = RunRecord::read(&path).map_err(|source| CtlError::Record { path, source })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            record,
        })
    }

    /// Report rows; a missing report reads as empty.
    pub fn report(&self) -> Result<Vec<ReportRow>> {
        let path = self.dir.join("report.tsv");
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(read_report(&path)?)
    }

    pub fn transcript_path(&self) -> PathBuf {
        self.dir.join("transcript.md")
    }
}

/// Every `run-*` directory with a readable record, newest first.
///
/// Directories whose record is missing or corrupt (a run still in progress,
/// or one killed mid-write) are skipped.
pub fn list_runs(workspace_root: &Path, status: Option<PipelineStatus>) -> Result<Vec<StoredRun>> {
    if !workspace_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in std::fs::read_dir(workspace_root)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with("run-") || !entry.path().is_dir() {
            continue;
        }
        let Ok(run) = StoredRun::load(&entry.path()) else {
            continue;
        };
        if status.is_some_and(|s| s != run.record.run.status) {
            continue;
        }
        runs.push(run);
    }
    runs.sort_by(|a, b| b.record.run.created_at.cmp(&a.record.run.created_at));
    Ok(runs)
}

/// Resolve a run by directory path, full id or unique id prefix.
pub fn find_run(workspace_root: &Path, key: &str) -> Result<StoredRun> {
    let as_path = Path::new(key);
    if as_path.join("run.json").is_file() {
        return StoredRun::load(as_path);
    }
    let key = key.strip_prefix("run-").unwrap_or(key);
    let direct = workspace_root.join(format!("run-{key}"));
    if direct.is_dir() {
        return StoredRun::load(&direct);
    }

    let mut matches: Vec<StoredRun> = list_runs(workspace_root, None)?
        .into_iter()
        .filter(|r| r.record.run.id.0.starts_with(key))
        .collect();
    match matches.len() {
        0 => Err(CtlError::RunNotFound(key.to_string())),
        1 => Ok(matches.remove(0)),
        count => Err(CtlError::Ambiguous {
            prefix: key.to_string(),
            count,
        }),
    }
}

/// Most recently created run, if any.
pub fn latest_run(workspace_root: &Path) -> Result<StoredRun> {
    list_runs(workspace_root, None)?
        .into_iter()
        .next()
        .ok_or_else(|| CtlError::RunNotFound("latest".to_string()))
}
