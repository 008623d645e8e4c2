//! Output rendering for verifyctl.
//!
//! Formats stored runs, classification results and generated tests for
//! terminal display.

use verify_core::acceptance::AcceptanceTest;
use verify_core::{Attempt, Classification, Extraction, PipelineRun, ReportRow};

use crate::runs::StoredRun;

/// Print a list of runs in tabular format.
pub fn print_run_list(runs: &[StoredRun]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!(
        "{:<36}  {:<8}  {:<8}  {:<19}  {}",
        "ID", "STATUS", "ATTEMPTS", "CREATED", "TASK"
    );
    println!("{}", "-".repeat(110));

    for stored in runs {
        let run = &stored.record.run;
        println!(
            "{:<36}  {:<8}  {:<8}  {:<19}  {}",
            run.id.0,
            run.status.as_str(),
            format!("{}/{}", run.attempts.len(), run.max_attempts()),
            format_time(&run.created_at),
            truncate(&run.task, 40),
        );
    }

    println!();
    println!("{} run(s)", runs.len());
}

/// Print a run, its attempts and (optionally) its event report.
pub fn print_run_details(stored: &StoredRun, report: &[ReportRow]) {
    let run = &stored.record.run;
    println!("Run: {}", run.id);
    println!();
    println!("  Task:        {}", run.task);
    println!("  Intent:      {}", run.intent.as_str());
    println!("  Status:      {}", run.status.as_str());
    println!("  Target:      {}", run.target.describe());
    println!("  Work Dir:    {}", run.target.work_dir);
    println!("  Attempts:    {}/{}", run.attempts.len(), run.max_attempts());
    println!("  Created:     {}", format_time(&run.created_at));
    if let Some(finished) = &run.finished_at {
        println!("  Finished:    {}", format_time(finished));
    }
    if let Some(error) = &run.error {
        println!("  Error:       {error}");
    }
    if !stored.record.files_touched.is_empty() {
        println!("  Files:       {}", stored.record.files_touched.join(", "));
    }

    for attempt in &run.attempts {
        print_attempt(attempt);
    }

    if !report.is_empty() {
        println!();
        println!("  Events:");
        println!("    {:<24}  {:<7}  {:<8}  {:<10}  {}", "KIND", "ATTEMPT", "EXIT", "STATUS", "MESSAGE");
        println!("    {}", "-".repeat(90));
        for row in report {
            println!(
                "    {:<24}  {:<7}  {:<8}  {:<10}  {}",
                row.kind,
                row.attempt.map_or_else(|| "-".to_string(), |a| a.to_string()),
                row.exit_code.map_or_else(|| "-".to_string(), |c| c.to_string()),
                row.status,
                truncate(&row.message, 60),
            );
        }
    }

    println!();
    println!("  Artifacts:");
    println!("    Run Dir:     {}", stored.dir.display());
    println!("    Transcript:  {}", stored.transcript_path().display());
    println!("    Record:      {}", stored.dir.join("run.json").display());
    println!("    Report:      {}", stored.dir.join("report.tsv").display());
}

fn print_attempt(attempt: &Attempt) {
    println!();
    println!(
        "  Attempt {} ({}):",
        attempt.ordinal,
        attempt.status.as_str()
    );
    for warning in &attempt.warnings {
        println!("    warning: {warning}");
    }
    for outcome in &attempt.outcomes {
        let exit = outcome
            .exit_code
            .map_or_else(|| "-".to_string(), |c| c.to_string());
        println!(
            "    {:<3} {:<24} exit={:<4} {}",
            if outcome.skipped { "--" } else if outcome.success { "ok" } else { "ERR" },
            outcome.label,
            exit,
            outcome.error.as_deref().or(outcome.note.as_deref()).unwrap_or(""),
        );
    }
    for report in &attempt.verdicts {
        println!(
            "    {} {}: {}",
            if report.verdict.passed { "PASS" } else { "FAIL" },
            report.name,
            report.verdict.reason
        );
    }
}

/// Print extracted blocks with their classification.
pub fn print_classification(task: &str, extraction: &Extraction, classification: &Classification) {
    if extraction.is_empty() {
        println!("No code blocks found.");
        return;
    }
    if extraction.recovered {
        println!("(no fences; recovered code from plain text)");
    }
    println!(
        "{:<4}  {:<10}  {:<15}  {:<6}  {}",
        "#", "LANG", "TAG", "LINES", "RULE"
    );
    println!("{}", "-".repeat(70));
    for unit in &classification.units {
        let language = if unit.language.is_empty() { "-" } else { unit.language.as_str() };
        println!(
            "{:<4}  {:<10}  {:<15}  {:<6}  {}{}",
            unit.ordinal + 1,
            language,
            unit.tag.as_str(),
            unit.text.lines().count(),
            unit.rule,
            if unit.forced { " (forced)" } else { "" },
        );
    }
    for warning in &classification.warnings {
        println!("warning: {warning}");
    }
    if classification.contradiction {
        println!("contradiction: every retained block works against \"{task}\"");
    }

    let hints = &extraction.hints;
    if let Some(timeout) = hints.timeout_sec {
        println!("timeout hint: {timeout}s");
    }
    if !hints.install.is_empty() {
        println!("install hint: {}", hints.install.join(" "));
    }
    if !hints.filenames.is_empty() {
        println!("filename hints: {}", hints.filenames.join(", "));
    }
}

/// Print generated acceptance tests with their probes.
pub fn print_tests(run: &PipelineRun, tests: &[AcceptanceTest]) {
    println!("Intent: {}", run.intent.as_str());
    println!("Target: {} ({})", run.target.describe(), run.target.work_dir);
    if tests.is_empty() {
        println!("No acceptance tests; success means every unit ran cleanly.");
        return;
    }
    for test in tests {
        println!();
        println!("  {}", test.name);
        for probe in &test.pre_probes {
            println!("    pre:  {probe}");
        }
        for probe in &test.post_probes {
            println!("    post: {probe}");
        }
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    let first_line = s.lines().next().unwrap_or_default();
    if first_line.chars().count() <= max_len && first_line.len() == s.len() {
        return s.to_string();
    }
    let cut: String = first_line.chars().take(max_len.saturating_sub(3)).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_single_lines() {
        assert_eq!(truncate("kill it", 20), "kill it");
    }

    #[test]
    fn truncate_cuts_long_and_multiline_text() {
        assert_eq!(truncate("abcdefghij", 6), "abc...");
        assert_eq!(truncate("first\nsecond", 20), "first...");
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }
}
