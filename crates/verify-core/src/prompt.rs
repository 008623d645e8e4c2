//! Instruction text sent to the assistant.
//!
//! Follow-ups are plain text: no markdown headings or fences, since some
//! assistant front-ends mangle them on input.

use crate::acceptance;
use crate::outcome::ExecutionOutcome;
use crate::types::{Target, TestReport};

/// Per-stream caps when echoing output back.
pub const FEEDBACK_STDERR_CHARS: usize = 2000;
pub const FEEDBACK_STDOUT_CHARS: usize = 500;

/// Default run timeout mentioned in the rules.
const DEFAULT_TIMEOUT_HINT_SEC: u32 = 30;

/// First instruction of a run.
pub fn initial_prompt(task: &str, target: &Target, context: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str("You are helping me write code that will be executed for real.\n");
    out.push_str(&format!(
        "Code will be deployed and executed on: {}\n",
        target.describe()
    ));
    out.push_str(&format!("Working directory: {}\n\n", target.work_dir));
    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        out.push_str(context.trim_end());
        out.push_str("\n\n");
    }
    out.push_str("RULES:\n");
    out.push_str("- Put all code inside fenced code blocks (```language ... ```).\n");
    out.push_str("- Use whatever language, tools, or packages you think are best.\n");
    out.push_str(
        "- If you need a package installed, include INSTALL: package1, package2 at the top of your response.\n",
    );
    out.push_str(&format!(
        "- If this will take longer than {DEFAULT_TIMEOUT_HINT_SEC} seconds to run, include TIMEOUT: <seconds> at the top of your response.\n"
    ));
    out.push_str("- Any output files should be saved in the working directory.\n");
    out.push_str("- ASCII only in code output. No emojis.\n");
    out.push_str("- Print clear status messages so I can see what happened.\n\n");
    out.push_str(&format!("TASK: {task}\n"));
    out
}

fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Follow-up after one or more units failed to execute cleanly.
pub fn execution_feedback(outcomes: &[ExecutionOutcome]) -> String {
    let mut lines = vec![
        "The code you just gave me has errors. Here are the execution results:".to_string(),
        String::new(),
    ];

    for outcome in outcomes {
        if outcome.success {
            if outcome.tentative {
                lines.push(format!(
                    "{}: OK, produced output before timeout (long-running program)",
                    outcome.label
                ));
            } else {
                lines.push(format!("{}: OK, ran successfully", outcome.label));
            }
            continue;
        }

        lines.push(format!("--- {} FAILED ---", outcome.label));
        match outcome.exit_code {
            Some(code) => lines.push(format!("Exit code: {code}")),
            None if outcome.timed_out => lines.push("Exit code: none (killed at timeout)".to_string()),
            None => {}
        }
        let stderr = outcome.stderr.trim();
        if !stderr.is_empty() {
            lines.push("STDERR:".to_string());
            lines.push(clip(stderr, FEEDBACK_STDERR_CHARS).to_string());
        }
        let stdout = outcome.stdout.trim();
        if !stdout.is_empty() {
            lines.push("STDOUT:".to_string());
            lines.push(clip(stdout, FEEDBACK_STDOUT_CHARS).to_string());
        }
        if let Some(error) = &outcome.error {
            lines.push(format!("Error: {error}"));
        }
        if let Some(note) = &outcome.note {
            lines.push(format!("Note: {note}"));
        }
        if !outcome.missing_modules.is_empty() {
            lines.push(format!(
                "Missing modules: {}",
                outcome.missing_modules.join(", ")
            ));
        }
        lines.push(String::new());
    }

    lines.push(
        "IMPORTANT: Do not use any third-party libraries unless absolutely necessary.".to_string(),
    );
    lines.push(
        "If you must use external packages, list them at the top of your response".to_string(),
    );
    lines.push("in this exact format: DEPENDENCIES: package1, package2, package3".to_string());
    lines.push(
        "If no external packages are needed, do NOT include a DEPENDENCIES line at all."
            .to_string(),
    );
    lines.push(String::new());
    lines.push(
        "Please fix the code. Return the complete corrected version, not just the changes."
            .to_string(),
    );
    lines.join("\n")
}

/// Follow-up after acceptance tests failed.
pub fn acceptance_feedback(reports: &[TestReport]) -> String {
    acceptance::format_failures(reports)
}

/// Re-prompt when a reply contained no code at all.
pub fn no_code_reprompt() -> String {
    "I need actual code to execute. Please respond with a complete script in a ```python or ```bash code block."
        .to_string()
}

/// Re-prompt when code was found but nothing was runnable.
pub fn no_units_reprompt() -> String {
    "None of the code blocks were executable. Please provide a runnable script. \
     Put it inside a fenced code block with a language tag (```python or ```bash) \
     and make it a complete program."
        .to_string()
}

/// Re-prompt after every runnable unit contradicted the task.
pub fn contradiction_reprompt(task: &str, warnings: &[String]) -> String {
    let mut lines = vec![
        "Your previous response did the opposite of what the task asks, so none of it was executed."
            .to_string(),
        String::new(),
    ];
    for warning in warnings {
        lines.push(format!("- {warning}"));
    }
    lines.push(String::new());
    lines.push(format!("TASK: {task}"));
    lines.push(String::new());
    lines.push(
        "Provide ONE complete, runnable program in a fenced code block that accomplishes the task directly."
            .to_string(),
    );
    lines.push(
        "Do NOT start, restart, or background any process, and do NOT write PID files.".to_string(),
    );
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RemoteHost;

    #[test]
    fn initial_prompt_contains_rules_and_task() {
        let target = Target::remote(RemoteHost::new("pi.local"), "~/verify");
        let prompt = initial_prompt("kill the counter", &target, Some("- hostname: pi"));
        assert!(prompt.contains("remote machine pi.local via SSH"));
        assert!(prompt.contains("- hostname: pi"));
        assert!(prompt.contains("INSTALL: package1, package2"));
        assert!(prompt.contains("TIMEOUT: <seconds>"));
        assert!(prompt.contains("ASCII only"));
        assert!(prompt.ends_with("TASK: kill the counter\n"));
    }

    #[test]
    fn initial_prompt_skips_empty_context() {
        let prompt = initial_prompt("x", &Target::local("/tmp/p"), Some("  "));
        assert!(prompt.contains("Working directory: /tmp/p\n\nRULES:"));
    }

    #[test]
    fn execution_feedback_truncates_streams() {
        let failed = ExecutionOutcome::new(0, "main.py").completed(
            Some(1),
            "o".repeat(900),
            format!("{}ModuleNotFoundError: No module named 'requests'", "e".repeat(10)),
        );
        let ok = ExecutionOutcome::new(1, "pkill -f counter").completed(
            Some(0),
            String::new(),
            String::new(),
        );
        let text = execution_feedback(&[failed, ok]);
        assert!(text.contains("--- main.py FAILED ---"));
        assert!(text.contains("Exit code: 1"));
        assert!(text.contains(&format!("STDOUT:\n{}\n", "o".repeat(500))));
        assert!(!text.contains(&"o".repeat(501)));
        assert!(text.contains("Missing modules: requests"));
        assert!(text.contains("pkill -f counter: OK, ran successfully"));
        assert!(text.contains("DEPENDENCIES: package1, package2, package3"));
        assert!(text.ends_with("not just the changes."));
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("héllo", 2), "hé");
        assert_eq!(clip("hi", 10), "hi");
    }

    #[test]
    fn contradiction_reprompt_restates_task() {
        let text = contradiction_reprompt("kill the counter", &["Block #1 relaunches".to_string()]);
        assert!(text.contains("- Block #1 relaunches"));
        assert!(text.contains("TASK: kill the counter"));
        assert!(text.contains("runnable program"));
    }
}
