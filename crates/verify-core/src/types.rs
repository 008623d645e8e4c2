//! Core types for the verification engine.
//!
//! A `PipelineRun` owns its attempts; each `Attempt` records what was sent to
//! the assistant, what came back, how the reply was classified, what ran and
//! what the acceptance tests concluded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::outcome::ExecutionOutcome;

/// Unique identifier for runs and sessions.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Where generated code executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[default]
    Local,
    Remote,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Target selection from config or CLI; `Auto` defers to the task text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSelection {
    #[default]
    Auto,
    Local,
    Remote,
}

impl TargetSelection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Coarse classification of the real-world effect a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    KillProcess,
    CreateFile,
    DeleteFile,
    #[default]
    Generic,
}

impl IntentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KillProcess => "kill_process",
            Self::CreateFile => "create_file",
            Self::DeleteFile => "delete_file",
            Self::Generic => "generic",
        }
    }

    /// Intents whose success means something stops existing.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::KillProcess | Self::DeleteFile)
    }
}

/// Classification tag for an extracted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitTag {
    /// Saved to a file and executed as a program.
    Program,
    /// Executed directly through the shell.
    DirectCommand,
    /// Example output, tips, placeholders; never executed.
    Discard,
}

impl UnitTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Program => "program",
            Self::DirectCommand => "direct_command",
            Self::Discard => "discard",
        }
    }

    pub fn is_retained(&self) -> bool {
        !matches!(self, Self::Discard)
    }
}

/// Terminal status of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failed,
    NoCode,
    Contradiction,
    NoRun,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::NoCode => "no_code",
            Self::Contradiction => "contradiction",
            Self::NoRun => "no_run",
        }
    }
}

/// Lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    #[default]
    Running,
    Success,
    Failed,
    /// Finished without executing anything (execution disabled).
    Done,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Done => "DONE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

// --- Targets ---

/// SSH destination for a remote target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHost {
    pub host: String,
    pub user: Option<String>,
    pub port: u16,
}

impl RemoteHost {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: 22,
        }
    }

    /// `user@host` or bare `host`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) if !user.is_empty() => format!("{user}@{}", self.host),
            _ => self.host.clone(),
        }
    }
}

/// The machine generated code runs on, plus the directory it runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub remote: Option<RemoteHost>,
    /// Directory probes list and programs execute in.
    pub work_dir: String,
}

impl Target {
    pub fn local(work_dir: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Local,
            remote: None,
            work_dir: work_dir.into(),
        }
    }

    pub fn remote(remote: RemoteHost, work_dir: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Remote,
            remote: Some(remote),
            work_dir: work_dir.into(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.kind == TargetKind::Remote
    }

    /// Human-readable description used in prompts and transcripts.
    pub fn describe(&self) -> String {
        match &self.remote {
            Some(remote) if self.is_remote() => {
                format!("remote machine {} via SSH", remote.destination())
            }
            _ => "this local machine".to_string(),
        }
    }
}

// --- Extraction and classification ---

/// A fenced (or recovered) block of text from an assistant reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Lowercased language tag; empty when the fence had none.
    pub language: String,
    pub text: String,
    pub ordinal: usize,
}

impl Block {
    pub fn new(ordinal: usize, language: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            language: language.into().to_lowercase(),
            text: text.into(),
            ordinal,
        }
    }

    /// File extension for saving the block as a program.
    pub fn extension(&self) -> &'static str {
        match self.language.as_str() {
            "python" | "py" => "py",
            "bash" | "sh" | "shell" | "zsh" | "" => "sh",
            "c" => "c",
            "cpp" | "c++" => "cpp",
            "javascript" | "js" => "js",
            "rust" => "rs",
            "java" => "java",
            "json" => "json",
            "yaml" | "yml" => "yaml",
            "html" => "html",
            "css" => "css",
            _ => "txt",
        }
    }
}

/// A classified block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub ordinal: usize,
    pub language: String,
    pub text: String,
    pub tag: UnitTag,
    /// Name of the classifier rule that produced `tag`.
    pub rule: String,
    /// Retained only because every unit would otherwise be discarded.
    #[serde(default)]
    pub forced: bool,
    /// SHA-256 of `text`, hex encoded.
    pub digest: String,
}

impl CodeUnit {
    pub fn new(block: &Block, tag: UnitTag, rule: impl Into<String>) -> Self {
        Self {
            ordinal: block.ordinal,
            language: block.language.clone(),
            text: block.text.clone(),
            tag,
            rule: rule.into(),
            forced: false,
            digest: content_digest(&block.text),
        }
    }

    pub fn block(&self) -> Block {
        Block::new(self.ordinal, self.language.clone(), self.text.clone())
    }
}

/// Hex SHA-256 of a unit's text.
pub fn content_digest(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// --- Acceptance results ---

/// Pass/fail decision for one acceptance test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub reason: String,
    #[serde(default)]
    pub evidence: BTreeMap<String, serde_json::Value>,
}

impl Verdict {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
            evidence: BTreeMap::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
            evidence: BTreeMap::new(),
        }
    }

    pub fn with_evidence(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.evidence.insert(key.to_string(), value.into());
        self
    }
}

/// A verdict labeled with the test that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub name: String,
    #[serde(flatten)]
    pub verdict: Verdict,
}

// --- Attempts and runs ---

/// One round trip: instruction out, reply in, execution, evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-indexed.
    pub ordinal: u32,
    pub instruction: String,
    pub response: String,
    pub units: Vec<CodeUnit>,
    /// Contradiction and extraction warnings surfaced for this attempt.
    #[serde(default)]
    pub warnings: Vec<String>,
    pub outcomes: Vec<ExecutionOutcome>,
    pub verdicts: Vec<TestReport>,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl Attempt {
    /// Units selected for execution.
    pub fn retained(&self) -> impl Iterator<Item = &CodeUnit> {
        self.units.iter().filter(|u| u.tag.is_retained())
    }

    pub fn failed_verdicts(&self) -> impl Iterator<Item = &TestReport> {
        self.verdicts.iter().filter(|v| !v.verdict.passed)
    }
}

#[derive(Debug, Error)]
#[error("run {0} is finalized")]
pub struct RunFinalized(pub Id);

/// A full verification run for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Id,
    pub task: String,
    pub target: Target,
    pub intent: IntentCategory,
    pub max_retries: u32,
    pub status: PipelineStatus,
    pub attempts: Vec<Attempt>,
    /// Transport or internal error that ended the run, if any.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(
        task: impl Into<String>,
        target: Target,
        intent: IntentCategory,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Id::new(),
            task: task.into(),
            target,
            intent,
            max_retries,
            status: PipelineStatus::Running,
            attempts: Vec::new(),
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Maximum attempts allowed: the first try plus `max_retries`.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn is_finalized(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append an attempt. Finalized runs are immutable.
    pub fn record(&mut self, attempt: Attempt) -> Result<(), RunFinalized> {
        if self.is_finalized() {
            return Err(RunFinalized(self.id.clone()));
        }
        self.attempts.push(attempt);
        Ok(())
    }

    /// Move to a terminal status. Only the first call has an effect.
    pub fn finalize(&mut self, status: PipelineStatus) {
        if self.is_finalized() || !status.is_terminal() {
            return;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Every file created or modified across all attempts, sorted and deduplicated.
    pub fn files_touched(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .attempts
            .iter()
            .flat_map(|a| a.outcomes.iter())
            .flat_map(|o| o.files_changed.iter().cloned())
            .collect();
        files.sort();
        files.dedup();
        files
    }
}
