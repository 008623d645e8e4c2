//! Structured end-of-run record (`run.json`).

use crate::config::Config;
use crate::types::PipelineRun;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid run record: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RecordError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(flatten)]
    pub run: PipelineRun,
    pub files_touched: Vec<String>,
    /// Effective configuration the run used.
    pub config: Config,
}

impl RunRecord {
    pub fn new(run: &PipelineRun, config: &Config) -> Self {
        Self {
            files_touched: run.files_touched(),
            run: run.clone(),
            config: config.clone(),
        }
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IntentCategory, PipelineStatus, Target};
    use tempfile::TempDir;

    #[test]
    fn record_survives_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.json");
        let mut run = PipelineRun::new(
            "create a file called notes.txt",
            Target::local("/tmp/p"),
            IntentCategory::CreateFile,
            2,
        );
        run.finalize(PipelineStatus::Success);

        RunRecord::new(&run, &Config::default()).write(&path).unwrap();
        assert!(!dir.path().join("run.json.tmp").exists());

        let back = RunRecord::read(&path).unwrap();
        assert_eq!(back.run.id, run.id);
        assert_eq!(back.run.status, PipelineStatus::Success);
        assert_eq!(back.config.max_retries, 3);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["task"], "create a file called notes.txt");
        assert_eq!(raw["status"], "SUCCESS");
    }

    #[test]
    fn garbage_is_a_json_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(RunRecord::read(&path), Err(RecordError::Json(_))));
    }
}
