//! Pure evaluators: two ordered lists of probe output in, one verdict out.

use super::parse::{file_list, process_list, size_samples, ProcessEntry};
use crate::types::Verdict;
use regex::RegexBuilder;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

fn first(outputs: &[String]) -> &str {
    outputs.first().map_or("", String::as_str)
}

fn matches_any(cmdline: &str, keywords: &[String]) -> bool {
    let cmdline = cmdline.to_lowercase();
    keywords
        .iter()
        .any(|k| cmdline.contains(&k.to_lowercase()))
}

fn pid_map(procs: &BTreeMap<u32, &ProcessEntry>) -> Value {
    let map: Map<String, Value> = procs
        .iter()
        .map(|(pid, entry)| (pid.to_string(), Value::from(entry.cmdline.clone())))
        .collect();
    Value::Object(map)
}

fn pid_list(procs: &BTreeMap<u32, &ProcessEntry>) -> String {
    let pids: Vec<String> = procs.keys().map(ToString::to_string).collect();
    format!("[{}]", pids.join(", "))
}

/// Every target PID seen before execution must be gone afterwards.
/// Processes that do not match the keywords are ignored.
pub fn kill_process(pre: &[String], post: &[String], keywords: &[String]) -> Verdict {
    let pre_procs = process_list(first(pre));
    let post_procs = process_list(first(post));

    let (targets, others): (BTreeMap<u32, &ProcessEntry>, BTreeMap<u32, &ProcessEntry>) =
        pre_procs
            .iter()
            .map(|(pid, entry)| (*pid, entry))
            .partition(|(_, entry)| matches_any(&entry.cmdline, keywords));
    let ignored: Vec<u32> = others.keys().copied().collect();

    if targets.is_empty() {
        let relaunched: BTreeMap<u32, &ProcessEntry> = post_procs
            .iter()
            .filter(|(pid, entry)| {
                !pre_procs.contains_key(pid) && matches_any(&entry.cmdline, keywords)
            })
            .map(|(pid, entry)| (*pid, entry))
            .collect();
        if !relaunched.is_empty() {
            return Verdict::fail(format!(
                "No matching processes found in pre-state, but NEW matching processes appeared \
                 in post-state (relaunched by the code). New PIDs: {}",
                pid_list(&relaunched)
            ))
            .with_evidence("pre_targets", Value::Object(Map::new()))
            .with_evidence("post_surviving", Value::Object(Map::new()))
            .with_evidence("new_matching", pid_map(&relaunched));
        }
        return Verdict::pass(
            "No matching processes found in pre-state (already dead or never existed).",
        )
        .with_evidence("pre_targets", Value::Object(Map::new()))
        .with_evidence("post_surviving", Value::Object(Map::new()))
        .with_evidence("pre_non_targets_ignored", ignored);
    }

    let surviving: BTreeMap<u32, &ProcessEntry> = targets
        .keys()
        .filter_map(|pid| post_procs.get(pid).map(|entry| (*pid, entry)))
        .collect();

    if surviving.is_empty() {
        return Verdict::pass(format!(
            "All {} target process(es) killed successfully. Ignored {} non-matching system process(es).",
            targets.len(),
            ignored.len()
        ))
        .with_evidence("pre_targets", pid_map(&targets))
        .with_evidence("post_surviving", Value::Object(Map::new()))
        .with_evidence("pre_non_targets_ignored", ignored);
    }

    let commands: Vec<&str> = surviving.values().map(|e| e.cmdline.as_str()).collect();
    Verdict::fail(format!(
        "{}/{} target process(es) still alive after execution. Surviving PIDs: {}. Commands: {:?}",
        surviving.len(),
        targets.len(),
        pid_list(&surviving),
        commands
    ))
    .with_evidence("pre_targets", pid_map(&targets))
    .with_evidence("post_surviving", pid_map(&surviving))
    .with_evidence("pre_non_targets_ignored", ignored)
}

/// Two size samples of the writer's log: equal means nobody is writing.
/// Missing or unreadable samples count as stopped.
pub fn file_stable(post: &[String], path: &str) -> Verdict {
    let raw: Vec<String> = first(post)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if raw.len() < 2 {
        return Verdict::pass(format!(
            "File {path} not found or unreadable (process likely dead)."
        ))
        .with_evidence("raw", raw);
    }
    let Some(samples) = size_samples(first(post)) else {
        return Verdict::pass("Could not parse file sizes (file may not exist).")
            .with_evidence("raw", raw);
    };
    let (size1, size2) = (samples[0], samples[1]);
    if size1 == size2 {
        return Verdict::pass(format!(
            "File {path} stopped growing (size stable at {size1} bytes). Process is dead."
        ))
        .with_evidence("size1", size1)
        .with_evidence("size2", size2);
    }
    let delta = size2 as i64 - size1 as i64;
    Verdict::fail(format!(
        "File {path} is STILL GROWING ({size1} -> {size2} bytes). Process is still alive!"
    ))
    .with_evidence("size1", size1)
    .with_evidence("size2", size2)
    .with_evidence("delta", delta)
}

/// At least one new file, and at least one new file matching a pattern.
pub fn file_created(pre: &[String], post: &[String], patterns: &[String]) -> Verdict {
    let pre_files = file_list(first(pre));
    let post_files = file_list(first(post));
    let new_files: Vec<String> = post_files.difference(&pre_files).cloned().collect();

    if new_files.is_empty() {
        return Verdict::fail("No new files were created.")
            .with_evidence("pre_files", pre_files.into_iter().collect::<Vec<_>>())
            .with_evidence("post_files", post_files.into_iter().collect::<Vec<_>>());
    }

    if !patterns.is_empty() {
        let compiled: Vec<regex::Regex> = patterns
            .iter()
            .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
            .collect();
        let matching = new_files
            .iter()
            .any(|f| compiled.iter().any(|re| re.is_match(f)));
        if !matching {
            return Verdict::fail(format!(
                "New files created ({new_files:?}) but none match expected patterns ({patterns:?})."
            ))
            .with_evidence("new_files", new_files)
            .with_evidence("expected", patterns.to_vec());
        }
    }

    Verdict::pass(format!("New file(s) created: {new_files:?}")).with_evidence("new_files", new_files)
}

/// The named file must be absent after execution.
pub fn file_removed(pre: &[String], post: &[String], name: &str) -> Verdict {
    let pre_files = file_list(first(pre));
    let post_files = file_list(first(post));

    if post_files.contains(name) {
        return Verdict::fail(format!("File {name} still exists after execution."))
            .with_evidence("post_files", post_files.into_iter().collect::<Vec<_>>());
    }
    if !pre_files.contains(name) {
        return Verdict::pass(format!(
            "File {name} was not present before execution (nothing to delete)."
        ))
        .with_evidence("present_before", false);
    }
    Verdict::pass(format!("File {name} was removed."))
        .with_evidence("present_before", true)
}

/// The first post output (file contents) must be non-empty and match every
/// pattern.
pub fn file_has_content(post: &[String], patterns: &[String]) -> Verdict {
    let content = first(post);
    if content.trim().is_empty() {
        return Verdict::fail("Output file is empty or does not exist.")
            .with_evidence("content_preview", "");
    }

    let missing: Vec<String> = patterns
        .iter()
        .filter(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_or(true, |re| !re.is_match(content))
        })
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Verdict::fail(format!("Output file missing expected patterns: {missing:?}"))
            .with_evidence("content_preview", preview(content, 500))
            .with_evidence("missing", missing);
    }

    Verdict::pass("Output file has expected content.")
        .with_evidence("content_preview", preview(content, 200))
}

fn preview(content: &str, max_chars: usize) -> String {
    content.chars().take(max_chars).collect()
}
