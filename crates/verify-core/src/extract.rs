//! Block extraction from assistant replies.
//!
//! Fenced blocks are the primary source. When a reply has no fences (the
//! markdown was flattened somewhere upstream) the longest run of code-looking
//! lines is recovered as a single block.

use crate::static_regex;
use crate::types::Block;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    static_regex(r"(?s)```([\w+#-]*)[ \t]*\r?\n(?:Copy\s*code\s*\n)?(.*?)\n[ \t]*```")
});

static TIMEOUT_HINT: LazyLock<Regex> = LazyLock::new(|| static_regex(r"(?i)TIMEOUT:\s*(\d+)"));

static INSTALL_HINT: LazyLock<Regex> =
    LazyLock::new(|| static_regex(r"(?im)^[ \t>*-]*(?:INSTALL|DEPENDENCIES):[ \t]*(.+)$"));

static FILENAME_HINTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)save\s+(?:it\s+)?as\s+[`"']?(\S+\.\w+)[`"']?"#,
        r#"(?i)(?:file|name)\s+(?:it\s+)?(?:called|named)\s+[`"']?(\S+\.\w+)[`"']?"#,
        r"\*\*(\w[\w.-]*\.\w+)\*\*",
        r"`(\w[\w.-]*\.\w+)`",
    ]
    .iter()
    .map(|p| static_regex(p))
    .collect()
});

static CODE_LINE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^(if|elif|else|for|while|try|except|with|return|yield|raise|pass|break|continue)\b",
        r"^\w+\s*=\s*",
        r"^\w+\s*[+\-*/]=",
        r"^\w+\.\w+\(",
        r"^\w+\s*\(",
        r"^#\s",
    ]
    .iter()
    .map(|p| static_regex(p))
    .collect()
});

static PROSE_LEAD: LazyLock<Regex> = LazyLock::new(|| {
    static_regex(
        r"^(Here |This version|The previous|It |To avoid|I |You |Note:|Now |If you |Run |Save |Usage|Why |So |Your )",
    )
});

static SENTENCE: LazyLock<Regex> =
    LazyLock::new(|| static_regex(r"^[A-Z][a-z]+ [a-z]+ [a-z]+ [a-z]+"));

const CODE_PREFIXES: &[&str] = &[
    "def ",
    "class ",
    "import ",
    "from ",
    "if __name__",
    "#!/",
    "#include",
    "int main",
    "void ",
    "fn ",
];

/// Recovered runs shorter than this are prose with incidental code.
const MIN_RECOVERED_LINES: usize = 3;
const MIN_RECOVERED_CHARS: usize = 20;

/// Clamp range for `TIMEOUT:` hints.
pub const TIMEOUT_HINT_RANGE: (u32, u32) = (5, 600);

/// Side-channel hints parsed from the reply text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionHints {
    /// Clamped to [`TIMEOUT_HINT_RANGE`].
    pub timeout_sec: Option<u32>,
    /// Packages named by `INSTALL:` or `DEPENDENCIES:` lines.
    pub install: Vec<String>,
    /// Candidate file names, in order of appearance.
    pub filenames: Vec<String>,
}

/// Everything pulled out of one reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    pub blocks: Vec<Block>,
    pub hints: ExtractionHints,
    /// True when blocks came from the unfenced fallback.
    pub recovered: bool,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

pub fn extract(text: &str) -> Extraction {
    let hints = extract_hints(text);
    let blocks = fenced_blocks(text);
    if !blocks.is_empty() {
        return Extraction {
            blocks,
            hints,
            recovered: false,
        };
    }
    let blocks: Vec<Block> = recover_unfenced(text).into_iter().collect();
    let recovered = !blocks.is_empty();
    Extraction {
        blocks,
        hints,
        recovered,
    }
}

/// Fenced blocks in order, deduplicated by content.
pub fn fenced_blocks(text: &str) -> Vec<Block> {
    let mut seen = HashSet::new();
    let mut blocks = Vec::new();
    for caps in FENCED_BLOCK.captures_iter(text) {
        let language = caps.get(1).map_or("", |m| m.as_str()).trim();
        let code = caps.get(2).map_or("", |m| m.as_str()).trim();
        if code.is_empty() || !seen.insert(code.to_string()) {
            continue;
        }
        blocks.push(Block::new(blocks.len(), language, code));
    }
    blocks
}

fn is_code_line(raw: &str, stripped: &str) -> bool {
    if stripped.is_empty() {
        return true;
    }
    if CODE_PREFIXES.iter().any(|p| stripped.starts_with(p)) {
        return true;
    }
    if (raw.starts_with("    ") || raw.starts_with('\t')) && stripped.len() > 1 {
        return true;
    }
    CODE_LINE.iter().any(|re| re.is_match(stripped))
}

fn is_prose_line(stripped: &str) -> bool {
    if PROSE_LEAD.is_match(stripped) {
        return true;
    }
    if stripped.starts_with("- ") || stripped.starts_with("* ") || stripped.starts_with("> ") {
        return true;
    }
    SENTENCE.is_match(stripped)
        && !["import ", "from ", "class ", "def "]
            .iter()
            .any(|kw| stripped.contains(kw))
}

/// Longest contiguous run of code lines; up to three blank lines may sit
/// inside a run.
fn recover_unfenced(text: &str) -> Option<Block> {
    fn close(start: Option<usize>, end: usize, best: &mut (usize, usize)) {
        if let Some(s) = start {
            if end > s && end - s > best.1 - best.0 {
                *best = (s, end);
            }
        }
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut best = (0, 0);
    let mut start: Option<usize> = None;
    let mut last_code = 0;
    let mut blanks = 0;

    for (i, raw) in lines.iter().enumerate() {
        let stripped = raw.trim();
        let code = !is_prose_line(stripped) && is_code_line(raw, stripped);
        if code && stripped.is_empty() {
            blanks += 1;
            if blanks > 3 {
                close(start, last_code + 1, &mut best);
                start = None;
                blanks = 0;
            }
            continue;
        }
        if code {
            blanks = 0;
            if start.is_none() {
                start = Some(i);
            }
            last_code = i;
        } else {
            close(start, last_code + 1, &mut best);
            start = None;
            blanks = 0;
        }
    }
    close(start, last_code + 1, &mut best);

    if best.1 - best.0 < MIN_RECOVERED_LINES {
        return None;
    }
    let code = lines[best.0..best.1].join("\n");
    let code = code.trim();
    if code.len() <= MIN_RECOVERED_CHARS {
        return None;
    }
    Some(Block::new(0, guess_language(code), code))
}

/// Best-effort language tag for recovered code.
pub fn guess_language(code: &str) -> &'static str {
    if code.contains("def ") || code.contains("import ") || code.contains("print(") {
        "python"
    } else if code.contains("#include") || code.contains("int main") {
        "c"
    } else if code.starts_with("#!/bin/bash") || code.starts_with("#!/bin/sh") {
        "bash"
    } else {
        "txt"
    }
}

pub fn extract_hints(text: &str) -> ExtractionHints {
    ExtractionHints {
        timeout_sec: timeout_hint(text),
        install: install_hints(text),
        filenames: filename_hints(text),
    }
}

pub fn timeout_hint(text: &str) -> Option<u32> {
    let caps = TIMEOUT_HINT.captures(text)?;
    let value: u64 = caps.get(1)?.as_str().parse().ok()?;
    let (lo, hi) = TIMEOUT_HINT_RANGE;
    Some(value.clamp(u64::from(lo), u64::from(hi)) as u32)
}

pub fn install_hints(text: &str) -> Vec<String> {
    let mut packages: Vec<String> = Vec::new();
    for caps in INSTALL_HINT.captures_iter(text) {
        let Some(list) = caps.get(1) else { continue };
        for raw in list.as_str().split(',') {
            let name = raw.trim().trim_matches(|c| c == '`' || c == '"' || c == '\'');
            let lower = name.to_lowercase();
            if name.is_empty()
                || lower == "none"
                || lower == "n/a"
                || name.contains(char::is_whitespace)
                || packages.iter().any(|p| p == name)
            {
                continue;
            }
            packages.push(name.to_string());
        }
    }
    packages
}

pub fn filename_hints(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for re in FILENAME_HINTS.iter() {
        for caps in re.captures_iter(text) {
            let Some(m) = caps.get(1) else { continue };
            let name = m.as_str().trim_matches(|c| c == '`' || c == '"' || c == '\'');
            if name.contains('.') && name.len() < 60 && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_blocks_in_order() {
        let text = "Here you go:\n```python\nprint('a')\n```\nthen\n```bash\npkill -f counter\n```\n";
        let blocks = fenced_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].language, "python");
        assert_eq!(blocks[0].text, "print('a')");
        assert_eq!(blocks[1].language, "bash");
        assert_eq!(blocks[1].ordinal, 1);
    }

    #[test]
    fn duplicate_blocks_are_dropped() {
        let text = "```sh\nls\n```\n\n```sh\nls\n```\n";
        assert_eq!(fenced_blocks(text).len(), 1);
    }

    #[test]
    fn untagged_fence_keeps_empty_language() {
        let blocks = fenced_blocks("```\necho hi\n```");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].language, "");
    }

    #[test]
    fn copy_code_banner_is_skipped() {
        let blocks = fenced_blocks("```python\nCopy code\nprint(1)\n```");
        assert_eq!(blocks[0].text, "print(1)");
    }

    #[test]
    fn c_plus_plus_tag_is_kept() {
        let blocks = fenced_blocks("```c++\nint main() { return 0; }\n```");
        assert_eq!(blocks[0].language, "c++");
        assert_eq!(blocks[0].extension(), "cpp");
    }

    #[test]
    fn recovers_unfenced_python() {
        let text = "Here is the script you asked for.\n\nimport time\n\ncount = 0\nwhile True:\n    count += 1\n    print(count)\n    time.sleep(1)\n\nYou can stop it with Ctrl+C.";
        let extraction = extract(text);
        assert!(extraction.recovered);
        assert_eq!(extraction.blocks.len(), 1);
        assert_eq!(extraction.blocks[0].language, "python");
        assert!(extraction.blocks[0].text.starts_with("import time"));
        assert!(extraction.blocks[0].text.ends_with("time.sleep(1)"));
    }

    #[test]
    fn prose_only_yields_nothing() {
        let text = "I cannot do that. You should ask someone who has access to the machine.";
        let extraction = extract(text);
        assert!(extraction.is_empty());
        assert!(!extraction.recovered);
    }

    #[test]
    fn guess_language_defaults_to_txt() {
        assert_eq!(guess_language("import os\nos.getcwd()"), "python");
        assert_eq!(guess_language("#include <stdio.h>"), "c");
        assert_eq!(guess_language("#!/bin/bash\necho hi"), "bash");
        assert_eq!(guess_language("a b c"), "txt");
    }

    #[test]
    fn timeout_hint_is_clamped() {
        assert_eq!(timeout_hint("TIMEOUT: 120"), Some(120));
        assert_eq!(timeout_hint("timeout: 1"), Some(5));
        assert_eq!(timeout_hint("TIMEOUT: 99999"), Some(600));
        assert_eq!(timeout_hint("no hint here"), None);
    }

    #[test]
    fn install_hints_split_and_dedupe() {
        let text = "INSTALL: requests, numpy\nDEPENDENCIES: numpy, `smbus2`\nINSTALL: none";
        assert_eq!(install_hints(text), vec!["requests", "numpy", "smbus2"]);
    }

    #[test]
    fn filename_hints_follow_pattern_order() {
        let text = "Save it as `counter.py` and run it. The log goes to **counter_log.txt**.";
        let names = filename_hints(text);
        assert_eq!(names, vec!["counter.py", "counter_log.txt"]);
    }
}
