//! File names for saved programs.

use crate::types::CodeUnit;

const FILLER: &[&str] = &[
    "make", "me", "a", "an", "the", "that", "which", "write", "create", "generate", "build", "in",
    "on", "for", "to", "and", "with", "of", "please", "can", "you",
];

/// Up to four meaningful words of the task joined by `_`; `program` when none.
pub fn make_slug(task: &str) -> String {
    let lower = task.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| w.len() > 1 && !FILLER.contains(w))
        .take(4)
        .collect();
    if words.is_empty() {
        "program".to_string()
    } else {
        words.join("_")
    }
}

/// Assign a file name to each program unit. A filename hint with a matching
/// extension is used once; otherwise the task slug, suffixed with the unit's
/// position when there are several programs.
pub fn assign_filenames(programs: &[&CodeUnit], task: &str, hints: &[String]) -> Vec<String> {
    let slug = make_slug(task);
    let mut remaining: Vec<&str> = hints.iter().map(String::as_str).collect();
    let mut taken: Vec<String> = Vec::new();

    for (i, unit) in programs.iter().enumerate() {
        let ext = unit.block().extension();
        let hinted = remaining
            .iter()
            .position(|h| extension_of(h) == Some(ext) && is_plain_name(h))
            .map(|pos| remaining.remove(pos).to_string());
        let mut name = hinted.unwrap_or_else(|| {
            if programs.len() == 1 {
                format!("{slug}.{ext}")
            } else {
                format!("{slug}_{i}.{ext}")
            }
        });
        if taken.contains(&name) {
            name = format!("{slug}_{i}.{ext}");
        }
        taken.push(name);
    }
    taken
}

fn extension_of(name: &str) -> Option<&str> {
    name.rsplit_once('.').map(|(_, ext)| ext)
}

/// Hints are used as bare file names only; anything with a path is ignored.
fn is_plain_name(name: &str) -> bool {
    !name.contains('/') && !name.contains('\\') && !name.starts_with('.')
}
