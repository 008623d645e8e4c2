//! Keyword-based reading of the task text.
//!
//! Everything here is a pure function of the task string. Matching is
//! case-insensitive and on word boundaries.

use crate::static_regex;
use crate::types::{IntentCategory, TargetKind, TargetSelection};
use regex::Regex;
use std::sync::LazyLock;

fn word_set(words: &[&str]) -> Regex {
    let alternation = words
        .iter()
        .map(|w| regex::escape(w).replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|");
    static_regex(&format!(r"(?i)\b(?:{alternation})\b"))
}

static KILL_WORDS: LazyLock<Regex> =
    LazyLock::new(|| word_set(&["kill", "stop", "terminate", "halt"]));
static PROCESS_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    word_set(&[
        "process", "script", "program", "running", "counter", "infinite", "runaway",
    ])
});
static DELETE_WORDS: LazyLock<Regex> = LazyLock::new(|| word_set(&["delete", "remove", "wipe"]));
static CREATE_WORDS: LazyLock<Regex> =
    LazyLock::new(|| word_set(&["create", "generate", "write", "make", "build"]));
static FILE_WORDS: LazyLock<Regex> =
    LazyLock::new(|| word_set(&["file", "txt", "output", "save", "text"]));
static LONG_RUNNING_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    word_set(&[
        "infinite",
        "forever",
        "daemon",
        "server",
        "continuous",
        "continuously",
        "background",
        "while true",
    ])
});
static REMOTE_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    word_set(&[
        "raspi",
        "raspberry pi",
        "pi 5",
        "rpi",
        "remote",
        "gpio",
        "i2c",
        "spi",
        "uart",
        "can bus",
        "sensor",
        "motor",
        "imu",
        "embedded",
        "hardware",
    ])
});
static LOCAL_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    word_set(&[
        "local",
        "locally",
        "this machine",
        "my computer",
        "my laptop",
    ])
});

static SCRIPT_NAME: LazyLock<Regex> = LazyLock::new(|| static_regex(r"(?i)\b(\w+\.py)\b"));
static FILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| static_regex(r"(?i)\b([\w-]+(?:\.[\w-]+)*\.[a-z0-9]{1,5})\b"));
static QUOTED: LazyLock<Regex> = LazyLock::new(|| static_regex(r#""([^"\n]{2,80})""#));

/// Descriptor phrases mapped to the process keyword they imply.
static DESCRIPTORS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (word_set(&["infinite counter"]), "infinite_counter"),
        (word_set(&["counter"]), "counter"),
        (word_set(&["infinite"]), "infinite"),
        (word_set(&["loop"]), "loop"),
    ]
});

const DEFAULT_TARGET_KEYWORDS: &[&str] = &["counter", "infinite"];

/// Log file sampled by the stability test when the task names none.
pub const DEFAULT_LOG_FILE: &str = "counter_log.txt";

/// Extensions treated as data files rather than programs.
const DATA_EXTENSIONS: &[&str] = &["txt", "log", "csv", "md", "json"];

pub fn has_kill_word(task: &str) -> bool {
    KILL_WORDS.is_match(task)
}

pub fn has_delete_word(task: &str) -> bool {
    DELETE_WORDS.is_match(task)
}

/// Tasks whose success means something stops existing.
pub fn is_destructive(task: &str) -> bool {
    has_kill_word(task) || has_delete_word(task)
}

/// Classify the task. Precedence: kill, delete, create, generic.
pub fn detect_intent(task: &str) -> IntentCategory {
    if has_kill_word(task) && PROCESS_WORDS.is_match(task) {
        IntentCategory::KillProcess
    } else if has_delete_word(task) {
        IntentCategory::DeleteFile
    } else if CREATE_WORDS.is_match(task) && FILE_WORDS.is_match(task) {
        IntentCategory::CreateFile
    } else {
        IntentCategory::Generic
    }
}

/// Programs for this task are expected to keep running.
pub fn is_long_running(task: &str) -> bool {
    LONG_RUNNING_WORDS.is_match(task) && !has_kill_word(task)
}

/// First `*.py` name mentioned in the task.
pub fn script_name(task: &str) -> Option<String> {
    SCRIPT_NAME
        .captures(task)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Keywords identifying the target process on a command line.
pub fn target_keywords(task: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    if let Some(script) = script_name(task) {
        if let Some((stem, _)) = script.rsplit_once('.') {
            let stem = stem.to_string();
            keywords.push(script);
            keywords.push(stem);
        }
    }
    for (pattern, keyword) in DESCRIPTORS.iter() {
        if pattern.is_match(task) && !keywords.iter().any(|k| k == keyword) {
            keywords.push((*keyword).to_string());
        }
    }
    if keywords.is_empty() {
        keywords = DEFAULT_TARGET_KEYWORDS
            .iter()
            .map(|k| (*k).to_string())
            .collect();
    }
    keywords
}

/// File names (`name.ext`) mentioned in the task, in order.
pub fn file_names(task: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in FILE_NAME.captures_iter(task) {
        let Some(m) = caps.get(1) else { continue };
        let name = m.as_str();
        let numeric_ext = name
            .rsplit_once('.')
            .is_some_and(|(_, ext)| ext.chars().all(|c| c.is_ascii_digit()));
        // Abbreviations ("e.g") and version numbers are not files.
        if name.len() < 4 || numeric_ext || names.iter().any(|n| n == name) {
            continue;
        }
        names.push(name.to_string());
    }
    names
}

/// First mentioned data file (`.txt`, `.log`, `.csv`, ...).
pub fn data_file(task: &str) -> Option<String> {
    file_names(task).into_iter().find(|name| {
        name.rsplit_once('.')
            .is_some_and(|(_, ext)| DATA_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
    })
}

/// Log file a runaway writer appends to.
pub fn log_file(task: &str) -> String {
    file_names(task)
        .into_iter()
        .find(|name| {
            name.rsplit_once('.').is_some_and(|(_, ext)| {
                matches!(ext.to_lowercase().as_str(), "txt" | "log" | "csv")
            })
        })
        .unwrap_or_else(|| DEFAULT_LOG_FILE.to_string())
}

/// Quoted phrases in the task; used as expected file content.
pub fn quoted_phrases(task: &str) -> Vec<String> {
    QUOTED
        .captures_iter(task)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Resolve `auto` target selection from the task text. Remote wins only with
/// a strictly higher score and a configured host.
pub fn select_target(task: &str, selection: TargetSelection, has_remote_host: bool) -> TargetKind {
    match selection {
        TargetSelection::Local => TargetKind::Local,
        TargetSelection::Remote => TargetKind::Remote,
        TargetSelection::Auto => {
            let remote = REMOTE_WORDS.find_iter(task).count();
            let local = LOCAL_WORDS.find_iter(task).count();
            if has_remote_host && remote > local {
                TargetKind::Remote
            } else {
                TargetKind::Local
            }
        }
    }
}
