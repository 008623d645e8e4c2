//! Execution outcomes and the timeout classification policy.
//!
//! A program killed at its timeout boundary is not automatically a failure:
//! long-running programs (loggers, servers, counters) are expected to be cut
//! off. Observed side effects decide.

use crate::deps;
use crate::static_regex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Result of executing one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub unit_ordinal: usize,
    /// Program file name or the command line.
    pub label: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Success inferred from side effects rather than a clean exit.
    pub tentative: bool,
    /// Launched in the background and sampled after the settle delay.
    pub detached: bool,
    /// Created or modified files, relative to the work dir.
    pub files_changed: Vec<String>,
    pub duration_ms: u64,
    pub note: Option<String>,
    /// Launch or compile failure, distinct from the program's own stderr.
    pub error: Option<String>,
    pub missing_modules: Vec<String>,
    /// Saved but never run: no interpreter for its type.
    #[serde(default)]
    pub skipped: bool,
}

impl ExecutionOutcome {
    pub fn new(unit_ordinal: usize, label: impl Into<String>) -> Self {
        Self {
            unit_ordinal,
            label: label.into(),
            ..Self::default()
        }
    }

    /// Fill in a process that exited on its own.
    pub fn completed(mut self, exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        self.success = exit_code == Some(0);
        self.exit_code = exit_code;
        self.stdout = stdout;
        self.stderr = stderr;
        self.missing_modules = deps::missing_modules(&self.stderr);
        self
    }

    /// A launch failure: nothing ran.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    /// Fill in a process killed at the timeout boundary and apply the policy.
    pub fn killed_at_timeout(
        mut self,
        timeout_sec: u32,
        stdout: String,
        stderr: String,
        files_changed: Vec<String>,
    ) -> Self {
        self.timed_out = true;
        self.exit_code = None;
        self.stdout = stdout;
        self.stderr = stderr;
        self.files_changed = files_changed;
        self.missing_modules = deps::missing_modules(&self.stderr);
        self.apply_timeout_policy(timeout_sec);
        self
    }

    /// A unit that was saved but not run. Not a success: nothing was
    /// checked.
    pub fn saved_only(mut self, note: impl Into<String>) -> Self {
        self.skipped = true;
        self.success = false;
        self.note = Some(note.into());
        self
    }

    /// Point a hung, looping program at the TIMEOUT hint.
    pub fn with_long_running_hint(mut self, code: &str) -> Self {
        if !self.timed_out || self.success {
            return self;
        }
        if let Some(why) = long_running_hint(code) {
            let base = self.note.take().unwrap_or_default();
            self.note = Some(format!(
                "{base}. The code looks long-running ({why}); add a `TIMEOUT: <seconds>` line or make it exit on its own."
            ));
        }
        self
    }

    pub fn with_files_changed(mut self, files: Vec<String>) -> Self {
        self.files_changed = files;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Decide success for an outcome that ran out of time.
    pub fn apply_timeout_policy(&mut self, timeout_sec: u32) {
        match classify_timeout(&self.stdout, &self.stderr, &self.files_changed) {
            TimeoutProgress::Clean => {
                self.success = true;
                self.tentative = true;
                let created = if self.files_changed.is_empty() {
                    "none".to_string()
                } else {
                    self.files_changed.join(", ")
                };
                self.note = Some(format!(
                    "Program was working when killed after {timeout_sec}s (created files: {created}). This is likely intentional behavior."
                ));
            }
            TimeoutProgress::WithErrors => {
                self.success = true;
                self.tentative = true;
                self.note = Some(format!(
                    "Program had output and warnings when killed after {timeout_sec}s."
                ));
            }
            TimeoutProgress::None => {
                self.success = false;
                self.tentative = false;
                self.note = Some(format!(
                    "Timed out after {timeout_sec}s with no output (possibly hung)"
                ));
            }
        }
    }
}

/// Evidence of useful work at the moment a program was killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutProgress {
    /// Output or file effects and an empty stderr.
    Clean,
    /// Output or file effects alongside stderr.
    WithErrors,
    /// No stdout and no file effects, whatever stderr says.
    None,
}

pub fn classify_timeout(stdout: &str, stderr: &str, files_changed: &[String]) -> TimeoutProgress {
    let progress = !stdout.trim().is_empty() || !files_changed.is_empty();
    if !progress {
        TimeoutProgress::None
    } else if stderr.trim().is_empty() {
        TimeoutProgress::Clean
    } else {
        TimeoutProgress::WithErrors
    }
}

static LONG_RUNNING_CODE: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\bwhile\s+True\b", "while True loop"),
        (r"\bwhile\s+1\b", "while 1 loop"),
        (r"\bfor\s+\w+\s+in\s+(?:itertools\.)?count\b", "infinite counter"),
        (r"\bsignal\.pause\b", "signal wait"),
        (r"\bserve_forever\b", "server"),
        (r"\bapp\.run\b", "web server"),
        (r"\bHTTPServer\b", "HTTP server"),
        (r"\binput\s*\(", "waiting for user input"),
        (r"\bwhile\s+(true|:)\s*;?\s*do\b", "shell loop"),
    ]
    .iter()
    .map(|(p, why)| (static_regex(p), *why))
    .collect()
});

/// Why a program is expected to run until killed, if it looks that way.
pub fn long_running_hint(code: &str) -> Option<&'static str> {
    LONG_RUNNING_CODE
        .iter()
        .find(|(re, _)| re.is_match(code))
        .map(|(_, why)| *why)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_output_and_no_files_is_failure_regardless_of_stderr() {
        for stderr in ["", "Traceback: boom"] {
            let outcome = ExecutionOutcome::new(0, "hang.py").killed_at_timeout(
                30,
                String::new(),
                stderr.to_string(),
                Vec::new(),
            );
            assert!(!outcome.success);
            assert!(!outcome.tentative);
            assert!(outcome.timed_out);
            assert!(outcome.note.unwrap().contains("possibly hung"));
        }
    }

    #[test]
    fn output_without_stderr_is_tentative_success() {
        let outcome = ExecutionOutcome::new(0, "counter.py").killed_at_timeout(
            30,
            "1\n2\n3\n".to_string(),
            String::new(),
            vec!["counter_log.txt".to_string()],
        );
        assert!(outcome.success);
        assert!(outcome.tentative);
        assert!(outcome.note.unwrap().contains("counter_log.txt"));
    }

    #[test]
    fn file_effects_alone_count_as_progress() {
        assert_eq!(
            classify_timeout("", "", &["out.csv".to_string()]),
            TimeoutProgress::Clean
        );
    }

    #[test]
    fn output_with_stderr_is_lower_confidence() {
        let outcome = ExecutionOutcome::new(0, "x.py").killed_at_timeout(
            10,
            "tick".to_string(),
            "DeprecationWarning".to_string(),
            Vec::new(),
        );
        assert!(outcome.success);
        assert!(outcome.tentative);
        assert!(outcome.note.unwrap().contains("warnings"));
    }

    #[test]
    fn completed_detects_missing_modules() {
        let outcome = ExecutionOutcome::new(0, "x.py").completed(
            Some(1),
            String::new(),
            "ModuleNotFoundError: No module named 'requests'".to_string(),
        );
        assert!(!outcome.success);
        assert_eq!(outcome.missing_modules, vec!["requests"]);
    }

    #[test]
    fn long_running_hints() {
        assert_eq!(
            long_running_hint("while True:\n    pass"),
            Some("while True loop")
        );
        assert_eq!(long_running_hint("print(1)"), None);
    }

    #[test]
    fn hung_loop_note_mentions_timeout_hint() {
        let code = "while True:\n    pass";
        let outcome = ExecutionOutcome::new(0, "spin.py")
            .killed_at_timeout(30, String::new(), String::new(), Vec::new())
            .with_long_running_hint(code);
        let note = outcome.note.unwrap();
        assert!(note.starts_with("Timed out after 30s"), "{note}");
        assert!(note.contains("while True loop"));
        assert!(note.contains("TIMEOUT:"));

        let working = ExecutionOutcome::new(0, "counter.py")
            .killed_at_timeout(30, "1\n".to_string(), String::new(), Vec::new())
            .with_long_running_hint(code);
        assert!(!working.note.unwrap().contains("TIMEOUT:"));
    }

    #[test]
    fn saved_only_is_neither_run_nor_success() {
        let outcome = ExecutionOutcome::new(2, "config.json").saved_only("Saved only, not directly runnable");
        assert!(outcome.skipped);
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, None);
    }
}
