//! Execution runner: runs retained units against a target and classifies
//! the outcome.
//!
//! Programs are saved into the run's programs dir, uploaded when the target
//! is remote, compiled when needed, then run under the run timeout. A
//! process killed at the timeout is judged by what it left behind: output
//! and file effects count as progress.

use crate::transport::{Transport, TransportError};
use crate::workspace::{self, DirSnapshot};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use verify_core::{shell, CodeUnit, Config, ExecutionOutcome, Target};

/// Output bytes read back from a detached program's log files.
const DETACHED_LOG_BYTES: usize = 64 * 1024;

/// Package installs get longer than programs.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Liveness and log sampling calls.
const SAMPLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Command labels are cut to this many characters.
const LABEL_CHARS: usize = 60;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub run_timeout_sec: u32,
    pub command_timeout_sec: u32,
    /// Wait after a detached launch before sampling it.
    pub settle_delay_sec: u32,
    /// Install template; `{package}` is replaced.
    pub install_cmd: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            run_timeout_sec: config.run_timeout_sec,
            command_timeout_sec: config.command_timeout_sec,
            settle_delay_sec: config.settle_delay_sec,
            install_cmd: config.install_cmd.clone(),
        }
    }
}

/// How a saved program file is started.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Launch {
    Interpret(String),
    Compile { build: String, run: String },
    Unsupported,
}

fn launch_for(filename: &str) -> Launch {
    let (stem, ext) = filename.rsplit_once('.').unwrap_or((filename, ""));
    let file = shell::quote(filename);
    let binary = shell::quote(stem);
    match ext {
        "py" => Launch::Interpret(format!("python3 -u {file}")),
        "sh" => Launch::Interpret(format!("bash {file}")),
        "js" => Launch::Interpret(format!("node {file}")),
        "java" => Launch::Interpret(format!("java {file}")),
        "c" => Launch::Compile {
            build: format!("gcc -O2 -o {binary} {file} -lm"),
            run: format!("./{binary}"),
        },
        "cpp" => Launch::Compile {
            build: format!("g++ -O2 -o {binary} {file}"),
            run: format!("./{binary}"),
        },
        _ => Launch::Unsupported,
    }
}

/// How a command reaches the target's shell.
#[derive(Debug, Clone, Copy)]
enum Invocation<'a> {
    /// A single command line built here, such as a program launch.
    Line(&'a str),
    /// Unit text, fed to the shell on stdin so it never shows up in a
    /// command line that `pkill -f` could match.
    Script(&'a str),
}

fn label_for_command(text: &str) -> String {
    let one_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match one_line.char_indices().nth(LABEL_CHARS) {
        Some((idx, _)) => one_line[..idx].to_string(),
        None => one_line,
    }
}

/// Executes units for one run.
#[derive(Debug, Clone)]
pub struct Runner {
    transport: Arc<dyn Transport>,
    target: Target,
    programs_dir: PathBuf,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(
        transport: Arc<dyn Transport>,
        target: Target,
        programs_dir: PathBuf,
        config: RunnerConfig,
    ) -> Self {
        Self {
            transport,
            target,
            programs_dir,
            config,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    fn in_work_dir(&self, command: &str) -> String {
        format!(
            "cd {} && {command}",
            shell::quote(self.target.work_dir.trim_end_matches('/'))
        )
    }

    fn script_in_work_dir(&self, script: &str) -> String {
        format!(
            "cd {} || exit 1\n{script}\n",
            shell::quote(self.target.work_dir.trim_end_matches('/'))
        )
    }

    /// File-effect snapshot of the work dir.
    pub async fn snapshot(&self) -> Result<DirSnapshot> {
        if !self.target.is_remote() {
            return Ok(workspace::snapshot_local(&self.programs_dir));
        }
        let output = self
            .transport
            .run(
                &workspace::remote_snapshot_command(&self.target.work_dir),
                SAMPLE_TIMEOUT,
            )
            .await?;
        Ok(workspace::parse_remote_snapshot(&output.stdout))
    }

    /// Write the program locally and, for remote targets, upload it.
    pub async fn stage(&self, unit: &CodeUnit, filename: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.programs_dir).await?;
        let local = self.programs_dir.join(filename);
        tokio::fs::write(&local, &unit.text).await?;
        if self.target.is_remote() {
            let mkdir = format!("mkdir -p {}", shell::quote(&self.target.work_dir));
            self.transport.run(&mkdir, SAMPLE_TIMEOUT).await?;
            let remote_path = format!("{}/{filename}", self.target.work_dir.trim_end_matches('/'));
            self.transport.upload(&local, &remote_path).await?;
            debug!(file = filename, remote_path, "program uploaded");
        }
        Ok(())
    }

    /// Run in the work dir and classify the result.
    async fn execute_timed(
        &self,
        unit_ordinal: usize,
        label: &str,
        invocation: Invocation<'_>,
        timeout_sec: u32,
    ) -> Result<ExecutionOutcome> {
        let timeout = Duration::from_secs(u64::from(timeout_sec));
        let before = self.snapshot().await?;
        let started = Instant::now();
        let output = match invocation {
            Invocation::Line(command) => {
                self.transport.run(&self.in_work_dir(command), timeout).await?
            }
            Invocation::Script(script) => {
                self.transport
                    .run_script(&self.script_in_work_dir(script), timeout)
                    .await?
            }
        };
        let elapsed = started.elapsed().as_millis() as u64;
        let after = self.snapshot().await?;
        let changed = workspace::changed_files(&before, &after);

        let outcome = ExecutionOutcome::new(unit_ordinal, label);
        let outcome = if output.timed_out {
            outcome.killed_at_timeout(timeout_sec, output.stdout, output.stderr, changed)
        } else {
            outcome
                .completed(output.exit_code, output.stdout, output.stderr)
                .with_files_changed(changed)
        };
        let outcome = outcome.with_duration_ms(elapsed);

        info!(
            unit = unit_ordinal,
            label,
            success = outcome.success,
            exit_code = ?outcome.exit_code,
            timed_out = outcome.timed_out,
            tentative = outcome.tentative,
            files_changed = outcome.files_changed.len(),
            duration_ms = elapsed,
            "unit executed"
        );
        Ok(outcome)
    }

    /// Save, stage and run a program unit.
    pub async fn run_program(
        &self,
        unit: &CodeUnit,
        filename: &str,
        timeout_sec: Option<u32>,
        detach: bool,
    ) -> Result<ExecutionOutcome> {
        self.stage(unit, filename).await?;
        self.run_staged(unit, filename, timeout_sec, detach).await
    }

    /// Run a program already written by [`Runner::stage`].
    ///
    /// `detach` launches it in the background and samples it after the
    /// settle delay instead of waiting for it.
    pub async fn run_staged(
        &self,
        unit: &CodeUnit,
        filename: &str,
        timeout_sec: Option<u32>,
        detach: bool,
    ) -> Result<ExecutionOutcome> {
        let timeout_sec = timeout_sec.unwrap_or(self.config.run_timeout_sec);

        let run = match launch_for(filename) {
            Launch::Interpret(run) => run,
            Launch::Compile { build, run } => {
                let compiled = self
                    .execute_timed(unit.ordinal, filename, Invocation::Line(&build), timeout_sec)
                    .await?;
                if !compiled.success {
                    warn!(file = filename, exit_code = ?compiled.exit_code, "compilation failed");
                    let mut failed = compiled.failed("compilation failed");
                    failed.tentative = false;
                    return Ok(failed);
                }
                run
            }
            Launch::Unsupported => {
                info!(file = filename, "saved only, not directly runnable");
                return Ok(ExecutionOutcome::new(unit.ordinal, filename)
                    .saved_only("Saved only, not directly runnable"));
            }
        };

        if detach {
            return self.run_detached(unit, filename, &run).await;
        }
        let outcome = self
            .execute_timed(unit.ordinal, filename, Invocation::Line(&run), timeout_sec)
            .await?;
        Ok(outcome.with_long_running_hint(&unit.text))
    }

    /// Run a direct command through the shell with the command timeout.
    pub async fn run_command(&self, unit: &CodeUnit) -> Result<ExecutionOutcome> {
        let label = label_for_command(&unit.text);
        let outcome = self
            .execute_timed(
                unit.ordinal,
                &label,
                Invocation::Script(unit.text.trim()),
                self.config.command_timeout_sec,
            )
            .await?;
        Ok(outcome.with_long_running_hint(&unit.text))
    }

    async fn sample(&self, command: &str) -> Result<String> {
        Ok(self
            .transport
            .run(&self.in_work_dir(command), SAMPLE_TIMEOUT)
            .await?
            .stdout)
    }

    async fn run_detached(
        &self,
        unit: &CodeUnit,
        filename: &str,
        run: &str,
    ) -> Result<ExecutionOutcome> {
        let stem = filename.rsplit_once('.').map_or(filename, |(stem, _)| stem);
        let before = self.snapshot().await?;
        let started = Instant::now();
        let pid = self
            .transport
            .run_detached(run, &self.target.work_dir, stem)
            .await?;
        let Some(pid) = pid else {
            return Ok(ExecutionOutcome::new(unit.ordinal, filename)
                .failed("detached launch did not report a PID"));
        };
        info!(file = filename, pid, settle_sec = self.config.settle_delay_sec, "launched detached");

        tokio::time::sleep(Duration::from_secs(u64::from(self.config.settle_delay_sec))).await;

        let alive = self
            .sample(&format!("kill -0 {pid} 2>/dev/null && echo ALIVE || echo DEAD"))
            .await?
            .trim()
            == "ALIVE";
        let stdout = self
            .sample(&format!("head -c {DETACHED_LOG_BYTES} {}", shell::quote(&format!("{stem}.out"))))
            .await?;
        let stderr = self
            .sample(&format!("head -c {DETACHED_LOG_BYTES} {}", shell::quote(&format!("{stem}.err"))))
            .await?;
        let after = self.snapshot().await?;
        let log_files = [format!("{stem}.out"), format!("{stem}.err")];
        let changed: Vec<String> = workspace::changed_files(&before, &after)
            .into_iter()
            .filter(|f| !log_files.contains(f))
            .collect();

        let mut outcome = ExecutionOutcome::new(unit.ordinal, filename)
            .with_duration_ms(started.elapsed().as_millis() as u64);
        outcome.detached = true;
        outcome.stdout = stdout;
        outcome.stderr = stderr;
        outcome.files_changed = changed;
        outcome.missing_modules = verify_core::deps::missing_modules(&outcome.stderr);

        if alive {
            outcome.apply_timeout_policy(self.config.settle_delay_sec);
            let policy_note = outcome.note.take().unwrap_or_default();
            outcome.note = Some(format!("Running detached as PID {pid}. {policy_note}"));
        } else {
            outcome.success = outcome.stderr.trim().is_empty();
            outcome.note = Some(format!(
                "Detached PID {pid} exited within {}s",
                self.config.settle_delay_sec
            ));
        }
        info!(
            file = filename,
            pid,
            alive,
            success = outcome.success,
            tentative = outcome.tentative,
            "detached program sampled"
        );
        Ok(outcome)
    }

    /// Install one package with the configured template. Returns success.
    pub async fn install(&self, package: &str) -> Result<bool> {
        let command = self
            .config
            .install_cmd
            .replace("{package}", &shell::quote(package));
        info!(package, command = %command, "installing dependency");
        let output = self
            .transport
            .run(&self.in_work_dir(&command), INSTALL_TIMEOUT)
            .await?;
        let ok = output.success();
        if !ok {
            warn!(package, exit_code = ?output.exit_code, stderr = %output.stderr.trim(), "install failed");
        }
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeTransport;
    use crate::transport::LocalTransport;
    use tempfile::TempDir;
    use verify_core::{Block, RemoteHost, UnitTag};

    fn unit(language: &str, text: &str) -> CodeUnit {
        CodeUnit::new(&Block::new(0, language, text), UnitTag::Program, "test")
    }

    fn local_runner(dir: &TempDir) -> Runner {
        let programs = dir.path().to_path_buf();
        Runner::new(
            Arc::new(LocalTransport::new()),
            Target::local(programs.to_string_lossy()),
            programs,
            RunnerConfig {
                run_timeout_sec: 5,
                command_timeout_sec: 5,
                settle_delay_sec: 0,
                install_cmd: "echo installing {package}".to_string(),
            },
        )
    }

    #[test]
    fn launch_recipes() {
        assert_eq!(launch_for("a.py"), Launch::Interpret("python3 -u a.py".to_string()));
        assert_eq!(
            launch_for("blink.c"),
            Launch::Compile {
                build: "gcc -O2 -o blink blink.c -lm".to_string(),
                run: "./blink".to_string()
            }
        );
        assert_eq!(launch_for("data.json"), Launch::Unsupported);
    }

    #[test]
    fn command_labels_are_single_line_and_short() {
        assert_eq!(label_for_command("pkill -f\n  counter.py"), "pkill -f counter.py");
        assert_eq!(label_for_command(&"x".repeat(100)).len(), LABEL_CHARS);
    }

    #[tokio::test]
    async fn program_runs_in_programs_dir() {
        let dir = TempDir::new().unwrap();
        let runner = local_runner(&dir);
        let outcome = runner
            .run_program(&unit("bash", "echo hi > out.txt; echo done"), "job.sh", None, false)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "done\n");
        assert_eq!(outcome.label, "job.sh");
        assert_eq!(outcome.files_changed, vec!["out.txt"]);
        assert!(dir.path().join("job.sh").exists());
    }

    #[tokio::test]
    async fn failing_program_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let outcome = local_runner(&dir)
            .run_program(&unit("bash", "echo broken >&2; exit 4"), "bad.sh", None, false)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(4));
        assert_eq!(outcome.stderr.trim(), "broken");
    }

    #[tokio::test]
    async fn timeout_with_output_is_tentative_success() {
        let dir = TempDir::new().unwrap();
        let outcome = local_runner(&dir)
            .run_program(
                &unit("bash", "echo tick > log.txt; echo started; sleep 30"),
                "loop.sh",
                Some(1),
                false,
            )
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.success);
        assert!(outcome.tentative);
        assert_eq!(outcome.files_changed, vec!["log.txt"]);
    }

    #[tokio::test]
    async fn silent_timeout_is_failure() {
        let dir = TempDir::new().unwrap();
        let outcome = local_runner(&dir)
            .run_program(&unit("bash", "echo oops >&2; sleep 30"), "hang.sh", Some(1), false)
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success);
        assert!(outcome.note.unwrap().contains("possibly hung"));
    }

    #[tokio::test]
    async fn unsupported_language_is_saved_not_run() {
        let dir = TempDir::new().unwrap();
        let outcome = local_runner(&dir)
            .run_program(&unit("rust", "fn main() {}"), "main.rs", None, false)
            .await
            .unwrap();
        assert!(outcome.skipped);
        assert!(!outcome.success);
        assert!(outcome.note.unwrap().contains("not directly runnable"));
        assert!(dir.path().join("main.rs").exists());
    }

    #[tokio::test]
    async fn staged_program_exists_before_it_runs() {
        let dir = TempDir::new().unwrap();
        let runner = local_runner(&dir);
        let program = unit("bash", "echo staged");
        runner.stage(&program, "early.sh").await.unwrap();
        assert!(dir.path().join("early.sh").exists());

        let outcome = runner.run_staged(&program, "early.sh", None, false).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.stdout, "staged\n");
        assert!(outcome.files_changed.is_empty());
    }

    #[tokio::test]
    async fn hung_loop_gets_timeout_hint() {
        let dir = TempDir::new().unwrap();
        let outcome = local_runner(&dir)
            .run_program(&unit("bash", "while true; do sleep 1; done"), "spin.sh", Some(1), false)
            .await
            .unwrap();
        assert!(!outcome.success);
        let note = outcome.note.unwrap();
        assert!(note.contains("possibly hung"), "{note}");
        assert!(note.contains("TIMEOUT:"), "{note}");
    }

    #[tokio::test]
    async fn direct_command_uses_shell() {
        let dir = TempDir::new().unwrap();
        let runner = local_runner(&dir);
        let ok = runner
            .run_command(&unit("bash", "true && echo 'it worked'"))
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.stdout, "it worked\n");
        let failed = runner.run_command(&unit("bash", "false")).await.unwrap();
        assert!(!failed.success);
        assert_eq!(failed.exit_code, Some(1));
    }

    #[tokio::test]
    async fn pkill_by_pattern_does_not_kill_its_own_shell() {
        let dir = TempDir::new().unwrap();
        let outcome = local_runner(&dir)
            .run_command(&unit("bash", "pkill -f runner_marker_5517 ; echo after"))
            .await
            .unwrap();
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.stdout, "after\n");
    }

    #[tokio::test]
    async fn remote_command_goes_over_stdin_in_work_dir() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new();
        let calls = transport.call_log();
        let runner = Runner::new(
            Arc::new(transport),
            Target::remote(RemoteHost::new("pi"), "~/work"),
            dir.path().to_path_buf(),
            RunnerConfig::default(),
        );
        runner.run_command(&unit("bash", "pkill -f counter.py")).await.unwrap();
        let calls = calls.lock().unwrap();
        assert!(calls.iter().any(|c| c == "cd ~/work || exit 1\npkill -f counter.py\n"));
        assert!(!calls.iter().any(|c| c.contains("sh -c")));
    }

    #[tokio::test]
    async fn install_renders_template() {
        let dir = TempDir::new().unwrap();
        assert!(local_runner(&dir).install("requests").await.unwrap());
    }

    #[tokio::test]
    async fn remote_program_is_uploaded_then_run() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new().on("python3 -u counter.py", "1\n2\n");
        let uploads = transport.upload_log();
        let calls = transport.call_log();
        let runner = Runner::new(
            Arc::new(transport),
            Target::remote(RemoteHost::new("pi"), "~/work"),
            dir.path().to_path_buf(),
            RunnerConfig::default(),
        );
        let outcome = runner
            .run_program(&unit("python", "print(1)"), "counter.py", None, false)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(uploads.lock().unwrap()[0].1, "~/work/counter.py");
        let calls = calls.lock().unwrap();
        assert!(calls.iter().any(|c| c == "mkdir -p ~/work"));
        assert!(calls.iter().any(|c| c == "cd ~/work && python3 -u counter.py"));
        assert!(calls.iter().any(|c| c.starts_with("find ~/work")));
    }

    #[tokio::test]
    async fn detached_program_alive_with_output_is_tentative() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new()
            .on("echo $!", "4242\n")
            .on("kill -0 4242", "ALIVE\n")
            .on("counter.out", "1\n2\n3\n");
        let runner = Runner::new(
            Arc::new(transport),
            Target::remote(RemoteHost::new("pi"), "~/work"),
            dir.path().to_path_buf(),
            RunnerConfig {
                settle_delay_sec: 0,
                ..RunnerConfig::default()
            },
        );
        let outcome = runner
            .run_program(&unit("python", "while True: pass"), "counter.py", None, true)
            .await
            .unwrap();
        assert!(outcome.detached);
        assert!(outcome.success);
        assert!(outcome.tentative);
        assert!(outcome.note.unwrap().starts_with("Running detached as PID 4242"));
    }

    #[tokio::test]
    async fn detached_program_that_crashed_fails() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new()
            .on("echo $!", "77\n")
            .on("kill -0 77", "DEAD\n")
            .on("counter.err", "ModuleNotFoundError: No module named 'serial'\n");
        let runner = Runner::new(
            Arc::new(transport),
            Target::remote(RemoteHost::new("pi"), "~/work"),
            dir.path().to_path_buf(),
            RunnerConfig {
                settle_delay_sec: 0,
                ..RunnerConfig::default()
            },
        );
        let outcome = runner
            .run_program(&unit("python", "import serial"), "counter.py", None, true)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.missing_modules, vec!["serial"]);
    }
}
