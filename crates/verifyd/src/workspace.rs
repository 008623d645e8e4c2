//! Run directories and file-effect snapshots.
//!
//! Layout per run: `<workspace_root>/run-<id>/` holding `transcript.md`,
//! `run.json`, `report.tsv`, a `programs/` dir the code runs in, and an
//! `outputs/` dir artifacts are swept into.

use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use verify_core::{shell, Id};

/// Paths of one run's record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub run_dir: PathBuf,
    pub programs_dir: PathBuf,
    pub outputs_dir: PathBuf,
}

impl RunLayout {
    pub fn run_dir(workspace_root: &Path, run_id: &Id) -> PathBuf {
        workspace_root.join(format!("run-{run_id}"))
    }

    /// Create the run directories. `shared_programs` makes a follow-up run
    /// execute in an earlier run's programs dir.
    pub fn create(
        workspace_root: &Path,
        run_id: &Id,
        shared_programs: Option<&Path>,
    ) -> io::Result<Self> {
        let run_dir = Self::run_dir(workspace_root, run_id);
        let programs_dir = shared_programs.map_or_else(|| run_dir.join("programs"), Path::to_path_buf);
        let outputs_dir = run_dir.join("outputs");
        for dir in [&run_dir, &programs_dir, &outputs_dir] {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            run_dir,
            programs_dir,
            outputs_dir,
        })
    }

    pub fn transcript_path(&self) -> PathBuf {
        self.run_dir.join("transcript.md")
    }

    pub fn record_path(&self) -> PathBuf {
        self.run_dir.join("run.json")
    }

    pub fn report_path(&self) -> PathBuf {
        self.run_dir.join("report.tsv")
    }
}

/// Modification time and size of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileState {
    pub mtime_ms: i64,
    pub size: u64,
}

/// Relative path → state, for the work dir and its immediate subdirectories.
pub type DirSnapshot = BTreeMap<String, FileState>;

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn file_state(meta: &fs::Metadata) -> FileState {
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as i64);
    FileState {
        mtime_ms,
        size: meta.len(),
    }
}

/// Snapshot a local directory one level deep, skipping dot entries.
/// Unreadable entries are left out; a missing directory is empty.
pub fn snapshot_local(dir: &Path) -> DirSnapshot {
    let mut snapshot = DirSnapshot::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return snapshot;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_hidden(&name) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_file() {
            snapshot.insert(name, file_state(&meta));
        } else if meta.is_dir() {
            let Ok(children) = fs::read_dir(entry.path()) else {
                continue;
            };
            for child in children.flatten() {
                let child_name = child.file_name().to_string_lossy().into_owned();
                if is_hidden(&child_name) {
                    continue;
                }
                if let Ok(meta) = child.metadata() {
                    if meta.is_file() {
                        snapshot.insert(format!("{name}/{child_name}"), file_state(&meta));
                    }
                }
            }
        }
    }
    snapshot
}

/// Remote equivalent of [`snapshot_local`]: one `path\tmtime\tsize` line per file.
pub fn remote_snapshot_command(dir: &str) -> String {
    format!(
        "find {} -mindepth 1 -maxdepth 2 -type f -not -path '*/.*' -printf '%P\\t%T@\\t%s\\n' 2>/dev/null",
        shell::quote(dir)
    )
}

pub fn parse_remote_snapshot(output: &str) -> DirSnapshot {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let path = cols.next()?.trim();
            let mtime: f64 = cols.next()?.trim().parse().ok()?;
            let size: u64 = cols.next()?.trim().parse().ok()?;
            if path.is_empty() {
                return None;
            }
            Some((
                path.to_string(),
                FileState {
                    mtime_ms: (mtime * 1000.0) as i64,
                    size,
                },
            ))
        })
        .collect()
}

/// New or modified files between two snapshots, in path order.
pub fn changed_files(before: &DirSnapshot, after: &DirSnapshot) -> Vec<String> {
    after
        .iter()
        .filter(|(path, state)| before.get(*path) != Some(state))
        .map(|(path, _)| path.clone())
        .collect()
}

const CODE_EXTENSIONS: &[&str] = &["py", "sh", "c", "cpp", "js", "rs", "java"];

/// Move new non-code top-level files from `programs_dir` into `outputs_dir`.
///
/// Program sources, their compiled binaries (`programs` stems) and files
/// present in `before` stay put. Returns the destination paths.
pub fn sweep_artifacts(
    programs_dir: &Path,
    outputs_dir: &Path,
    before: &DirSnapshot,
    programs: &[String],
) -> io::Result<Vec<PathBuf>> {
    let stems: Vec<&str> = programs
        .iter()
        .map(|p| p.rsplit_once('.').map_or(p.as_str(), |(stem, _)| stem))
        .collect();
    let after = snapshot_local(programs_dir);
    let mut moved = Vec::new();

    for name in after.keys().filter(|k| !k.contains('/') && !before.contains_key(*k)) {
        let (stem, ext) = name.rsplit_once('.').unwrap_or((name.as_str(), ""));
        if CODE_EXTENSIONS.contains(&ext) || programs.contains(name) || stems.contains(&name.as_str()) {
            continue;
        }
        fs::create_dir_all(outputs_dir)?;
        let mut dest = outputs_dir.join(name);
        if dest.exists() {
            let stamp = Utc::now().format("%Y%m%d_%H%M%S");
            let renamed = if ext.is_empty() {
                format!("{stem}_{stamp}")
            } else {
                format!("{stem}_{stamp}.{ext}")
            };
            dest = outputs_dir.join(renamed);
        }
        let src = programs_dir.join(name);
        if let Err(err) = fs::rename(&src, &dest) {
            // Cross-device moves fall back to copy and delete.
            debug!(error = %err, src = %src.display(), "rename failed, copying");
            fs::copy(&src, &dest)?;
            if let Err(err) = fs::remove_file(&src) {
                warn!(error = %err, src = %src.display(), "failed to remove swept artifact");
            }
        }
        moved.push(dest);
    }
    Ok(moved)
}
