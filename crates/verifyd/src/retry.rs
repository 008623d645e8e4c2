//! Retry policy: decide after each attempt whether the run stops or loops,
//! and build the follow-up instruction when it loops.

use tracing::{debug, info};
use verify_core::{prompt, Attempt, AttemptStatus, PipelineStatus};

/// Where an attempt is in its pass through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Prompting,
    Extracting,
    Classifying,
    Executing,
    Testing,
}

impl AttemptPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompting => "prompting",
            Self::Extracting => "extracting",
            Self::Classifying => "classifying",
            Self::Executing => "executing",
            Self::Testing => "testing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// The first try plus every retry.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// What happens after `attempt`.
    pub fn decide(&self, task: &str, attempt: &Attempt) -> Decision {
        let decision = match attempt.status {
            AttemptStatus::Success => Decision::Stop {
                status: PipelineStatus::Success,
                reason: None,
            },
            AttemptStatus::NoRun => Decision::Stop {
                status: PipelineStatus::Done,
                reason: Some("execution disabled".to_string()),
            },
            _ if attempt.ordinal >= self.max_attempts() => Decision::Stop {
                status: PipelineStatus::Failed,
                reason: Some(exhausted_reason(attempt)),
            },
            AttemptStatus::NoCode => Decision::Retry {
                instruction: prompt::no_code_reprompt(),
            },
            AttemptStatus::Contradiction => Decision::Retry {
                instruction: prompt::contradiction_reprompt(task, &attempt.warnings),
            },
            AttemptStatus::Failed => Decision::Retry {
                instruction: failure_feedback(attempt),
            },
        };
        match &decision {
            Decision::Stop { status, reason } => info!(
                attempt = attempt.ordinal,
                status = status.as_str(),
                reason = reason.as_deref().unwrap_or(""),
                "run stopping"
            ),
            Decision::Retry { instruction } => debug!(
                attempt = attempt.ordinal,
                attempt_status = attempt.status.as_str(),
                instruction_chars = instruction.len(),
                "retry scheduled"
            ),
        }
        decision
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Stop {
        status: PipelineStatus,
        reason: Option<String>,
    },
    Retry {
        instruction: String,
    },
}

impl Decision {
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Acceptance evidence wins over raw execution output when both exist.
/// Units that were only saved do not count as executed.
fn failure_feedback(attempt: &Attempt) -> String {
    if attempt.failed_verdicts().next().is_some() {
        prompt::acceptance_feedback(&attempt.verdicts)
    } else if attempt.outcomes.iter().all(|o| o.skipped) {
        prompt::no_units_reprompt()
    } else {
        prompt::execution_feedback(&attempt.outcomes)
    }
}

/// Attempt count plus the last piece of evidence.
fn exhausted_reason(attempt: &Attempt) -> String {
    let evidence = if let Some(report) = attempt.failed_verdicts().next() {
        format!("{}: {}", report.name, report.verdict.reason)
    } else if let Some(outcome) = attempt.outcomes.iter().find(|o| !o.success) {
        outcome
            .error
            .clone()
            .or_else(|| outcome.note.clone())
            .or_else(|| outcome.stderr.lines().last().map(str::to_string))
            .unwrap_or_else(|| format!("{} failed", outcome.label))
    } else if let Some(warning) = attempt.warnings.first() {
        warning.clone()
    } else {
        format!("last attempt ended {}", attempt.status.as_str())
    };
    format!(
        "gave up after {} attempt{}; {evidence}",
        attempt.ordinal,
        if attempt.ordinal == 1 { "" } else { "s" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use verify_core::{Block, CodeUnit, ExecutionOutcome, TestReport, UnitTag, Verdict};

    fn attempt(ordinal: u32, status: AttemptStatus) -> Attempt {
        Attempt {
            ordinal,
            instruction: String::new(),
            response: String::new(),
            units: Vec::new(),
            warnings: Vec::new(),
            outcomes: Vec::new(),
            verdicts: Vec::new(),
            status,
            started_at: Utc::now(),
            ended_at: Utc::now(),
        }
    }

    #[test]
    fn success_and_no_run_stop_immediately() {
        let policy = RetryPolicy::new(3);
        assert_eq!(
            policy.decide("t", &attempt(1, AttemptStatus::Success)),
            Decision::Stop {
                status: PipelineStatus::Success,
                reason: None
            }
        );
        let Decision::Stop { status, .. } = policy.decide("t", &attempt(1, AttemptStatus::NoRun)) else {
            panic!("expected stop");
        };
        assert_eq!(status, PipelineStatus::Done);
    }

    #[test]
    fn budget_allows_exactly_retries_plus_one() {
        let policy = RetryPolicy::new(2);
        assert!(policy.decide("t", &attempt(1, AttemptStatus::Failed)).is_retry());
        assert!(policy.decide("t", &attempt(2, AttemptStatus::NoCode)).is_retry());
        let Decision::Stop { status, reason } = policy.decide("t", &attempt(3, AttemptStatus::Failed)) else {
            panic!("expected stop");
        };
        assert_eq!(status, PipelineStatus::Failed);
        assert!(reason.unwrap().starts_with("gave up after 3 attempts"));
    }

    #[test]
    fn zero_retries_stops_after_first_failure() {
        let policy = RetryPolicy::new(0);
        assert!(!policy.decide("t", &attempt(1, AttemptStatus::Contradiction)).is_retry());
    }

    #[test]
    fn no_code_gets_no_code_reprompt() {
        let policy = RetryPolicy::new(3);
        let Decision::Retry { instruction } = policy.decide("t", &attempt(1, AttemptStatus::NoCode)) else {
            panic!("expected retry");
        };
        assert_eq!(instruction, prompt::no_code_reprompt());
    }

    #[test]
    fn nothing_runnable_asks_for_a_runnable_script() {
        let policy = RetryPolicy::new(3);
        let mut discarded = attempt(1, AttemptStatus::Failed);
        discarded
            .units
            .push(CodeUnit::new(&Block::new(0, "text", "output"), UnitTag::Discard, "prose"));
        let Decision::Retry { instruction } = policy.decide("t", &discarded) else {
            panic!("expected retry");
        };
        assert_eq!(instruction, prompt::no_units_reprompt());

        let mut saved = attempt(1, AttemptStatus::Failed);
        saved
            .outcomes
            .push(ExecutionOutcome::new(0, "config.json").saved_only("Saved only, not directly runnable"));
        let Decision::Retry { instruction } = policy.decide("t", &saved) else {
            panic!("expected retry");
        };
        assert!(instruction.starts_with("None of the code blocks were executable."));
    }

    #[test]
    fn contradiction_feedback_names_the_task() {
        let mut a = attempt(1, AttemptStatus::Contradiction);
        a.warnings.push("Block #1 (bash) contains a process launch".to_string());
        let Decision::Retry { instruction } = RetryPolicy::new(3).decide("kill the counter", &a) else {
            panic!("expected retry");
        };
        assert!(instruction.contains("TASK: kill the counter"));
        assert!(instruction.contains("process launch"));
    }

    #[test]
    fn failed_acceptance_feedback_beats_execution_output() {
        let mut a = attempt(1, AttemptStatus::Failed);
        a.outcomes
            .push(ExecutionOutcome::new(0, "kill.sh").completed(Some(0), "done\n".into(), String::new()));
        a.verdicts.push(TestReport {
            name: "process_killed".to_string(),
            verdict: Verdict::fail("PIDs still running: 4242"),
        });
        let Decision::Retry { instruction } = RetryPolicy::new(3).decide("t", &a) else {
            panic!("expected retry");
        };
        assert!(instruction.contains("process_killed"));
        assert!(instruction.contains("4242"));
    }

    #[test]
    fn failed_execution_feedback_carries_stderr() {
        let mut a = attempt(1, AttemptStatus::Failed);
        a.outcomes.push(ExecutionOutcome::new(0, "main.py").completed(
            Some(1),
            String::new(),
            "NameError: name 'x' is not defined\n".into(),
        ));
        let Decision::Retry { instruction } = RetryPolicy::new(3).decide("t", &a) else {
            panic!("expected retry");
        };
        assert!(instruction.contains("NameError"));
    }

    #[test]
    fn exhausted_reason_uses_last_evidence() {
        let mut a = attempt(1, AttemptStatus::Failed);
        a.outcomes
            .push(ExecutionOutcome::new(0, "main.c").failed("compilation failed"));
        let Decision::Stop { reason, .. } = RetryPolicy::new(0).decide("t", &a) else {
            panic!("expected stop");
        };
        assert_eq!(reason.as_deref(), Some("gave up after 1 attempt; compilation failed"));
    }

    #[test]
    fn phase_names() {
        assert_eq!(AttemptPhase::Classifying.as_str(), "classifying");
    }
}
