//! Parsers for raw probe output.

use crate::static_regex;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

/// Marker printed by the process probe when nothing matched.
pub const PROCESS_NOT_FOUND: &str = "PROCESS_NOT_FOUND";

static PGREP_ROW: LazyLock<Regex> = LazyLock::new(|| static_regex(r"^(\d+)\s+(.+)$"));
static LONG_ROW: LazyLock<Regex> =
    LazyLock::new(|| static_regex(r"^[-dlcbps][rwxsStT-]{9}[.@+]?\s"));

/// One process from a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub user: Option<String>,
    pub cmdline: String,
}

/// Parse `pgrep -a` (`PID CMDLINE`) or `ps aux` rows into PID → entry.
pub fn process_list(output: &str) -> BTreeMap<u32, ProcessEntry> {
    let mut procs = BTreeMap::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line == PROCESS_NOT_FOUND {
            continue;
        }
        if let Some(caps) = PGREP_ROW.captures(line) {
            if let Ok(pid) = caps[1].parse() {
                procs.insert(
                    pid,
                    ProcessEntry {
                        user: None,
                        cmdline: caps[2].trim().to_string(),
                    },
                );
            }
            continue;
        }
        // USER PID %CPU %MEM VSZ RSS TTY STAT START TIME COMMAND...
        let parts = split_columns(line, 11);
        if parts.len() == 11 {
            if let Ok(pid) = parts[1].parse() {
                procs.insert(
                    pid,
                    ProcessEntry {
                        user: Some(parts[0].to_string()),
                        cmdline: parts[10].trim().to_string(),
                    },
                );
            }
        }
    }
    procs
}

/// Split on runs of whitespace into at most `n` columns; the last column
/// keeps its inner spacing.
fn split_columns(line: &str, n: usize) -> Vec<&str> {
    let mut cols = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    while cols.len() + 1 < n {
        let Some(end) = rest.find(char::is_whitespace) else {
            break;
        };
        cols.push(&rest[..end]);
        rest = rest[end..].trim_start();
        if rest.is_empty() {
            break;
        }
    }
    if !rest.is_empty() {
        cols.push(rest);
    }
    cols
}

/// Parse `ls -1` or `ls -la` output into regular file names. Directory and
/// symlink rows are skipped along with the `total` header.
pub fn file_list(output: &str) -> BTreeSet<String> {
    let mut files = BTreeSet::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("total ") {
            continue;
        }
        if LONG_ROW.is_match(line) {
            if !line.starts_with('-') {
                continue;
            }
            let cols = split_columns(line, 9);
            if cols.len() == 9 {
                files.insert(cols[8].to_string());
            }
            continue;
        }
        if line.starts_with("ls:") {
            continue;
        }
        files.insert(line.to_string());
    }
    files
}

/// Integer samples, one per line; `None` when any line is not a number.
pub fn size_samples(output: &str) -> Option<Vec<u64>> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pgrep_rows() {
        let out = "1172 /usr/bin/wayvnc --render-cursor\n2080 python3 counter.py\n";
        let procs = process_list(out);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[&2080].cmdline, "python3 counter.py");
        assert!(procs[&1172].user.is_none());
    }

    #[test]
    fn parses_ps_aux_rows() {
        let out = "USER PID %CPU %MEM VSZ RSS TTY STAT START TIME COMMAND\n\
                   pi    2080  0.3  0.1  12345  6789 pts/0  S+  10:00  0:01 python3 counter.py --fast\n";
        let procs = process_list(out);
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[&2080].user.as_deref(), Some("pi"));
        assert_eq!(procs[&2080].cmdline, "python3 counter.py --fast");
    }

    #[test]
    fn not_found_marker_is_empty() {
        assert!(process_list(PROCESS_NOT_FOUND).is_empty());
        assert!(process_list("").is_empty());
    }

    #[test]
    fn parses_long_listing() {
        let out = "total 12\n\
                   drwxr-xr-x 2 pi pi 4096 Jan  1 10:00 .\n\
                   drwxr-xr-x 9 pi pi 4096 Jan  1 10:00 ..\n\
                   -rw-r--r-- 1 pi pi   42 Jan  1 10:00 counter_log.txt\n\
                   lrwxrwxrwx 1 pi pi    7 Jan  1 10:00 latest -> out.txt\n\
                   -rw-r--r-- 1 pi pi   10 Jan  1 10:01 my notes.md\n";
        let files = file_list(out);
        assert_eq!(
            files.into_iter().collect::<Vec<_>>(),
            vec!["counter_log.txt", "my notes.md"]
        );
    }

    #[test]
    fn parses_short_listing() {
        let files = file_list("a.txt\nb.py\n");
        assert!(files.contains("a.txt"));
        assert!(files.contains("b.py"));
    }

    #[test]
    fn size_samples_require_numbers() {
        assert_eq!(size_samples("10\n12\n"), Some(vec![10, 12]));
        assert_eq!(size_samples("10\nstat: cannot stat\n"), None);
        assert_eq!(size_samples(""), Some(vec![]));
    }
}
