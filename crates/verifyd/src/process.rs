//! Child process capture with a timeout supervisor.
//!
//! Each stream is drained by its own producer task into a channel. The
//! supervisor owns the timer: on timeout it kills the child, gives the
//! readers a grace period to reach EOF, then cancels them. Output seen before
//! the kill is kept in both cases.
//!
//! Children lead their own process group so a timeout kill reaches the
//! interpreter behind a `sh -c` wrapper and anything it spawned.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long readers may keep draining after the child exits or is killed.
///
/// Grandchildren holding the pipe open would otherwise block forever.
pub const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum bytes kept per stream.
pub const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

const CHUNK_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("program not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Everything observed from one child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
    /// `None` when killed or terminated by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl Captured {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Producer: forward chunks until EOF, the byte cap, or cancellation.
async fn drain<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    stream: &'static str,
) {
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut total = 0usize;
    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => {
                debug!(stream, "reader cancelled");
                return;
            }
            read = reader.read(&mut chunk) => read,
        };
        match read {
            Ok(0) => return,
            Ok(n) => {
                let keep = n.min(MAX_OUTPUT_BYTES.saturating_sub(total));
                if keep == 0 {
                    // Over the cap: keep reading so the child never blocks on a full pipe.
                    continue;
                }
                if keep < n {
                    warn!(stream, max_bytes = MAX_OUTPUT_BYTES, "output exceeded limit, truncating");
                }
                total += keep;
                if tx.send(chunk[..keep].to_vec()).is_err() {
                    return;
                }
            }
            Err(err) => {
                debug!(stream, error = %err, "read failed");
                return;
            }
        }
    }
}

/// Collect whatever a producer sends until it finishes or the deadline passes.
async fn collect(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, buf: &mut Vec<u8>, deadline: Instant) {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) | Err(_) => return,
        }
    }
}

/// Run `cmd` to completion or until `timeout` elapses.
///
/// `stdin` is written and closed before waiting. A zero timeout waits
/// indefinitely.
pub async fn capture(mut cmd: Command, stdin: Option<&str>, timeout: Duration) -> Result<Captured> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .process_group(0)
    .kill_on_drop(true);

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ProcessError::NotFound(program.clone())
        } else {
            ProcessError::Spawn {
                program: program.clone(),
                source,
            }
        }
    })?;

    let cancel = CancellationToken::new();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    let stdout_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(drain(pipe, out_tx, cancel.clone(), "stdout")));
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(drain(pipe, err_tx, cancel.clone(), "stderr")));

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // A child that exits without reading closes the pipe; that is not an error here.
        if let Err(err) = pipe.write_all(input.as_bytes()).await {
            debug!(program = %program, error = %err, "stdin write failed");
        }
        drop(pipe);
    }

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let limit = if timeout.is_zero() {
        None
    } else {
        Some(started + timeout)
    };

    // Supervisor: drain while waiting so partial output survives the kill.
    let (exit_code, timed_out) = loop {
        let sleep_until = limit.map_or_else(
            || tokio::time::Instant::now() + Duration::from_secs(3600),
            tokio::time::Instant::from_std,
        );
        tokio::select! {
            status = child.wait() => break (status?.code(), false),
            Some(chunk) = out_rx.recv() => stdout.extend_from_slice(&chunk),
            Some(chunk) = err_rx.recv() => stderr.extend_from_slice(&chunk),
            () = tokio::time::sleep_until(sleep_until), if limit.is_some() => {
                debug!(program = %program, timeout_ms = timeout.as_millis() as u64, "timeout reached; killing");
                kill_group(&child, &program);
                if let Err(err) = child.kill().await {
                    warn!(program = %program, error = %err, "failed to kill timed-out process");
                }
                break (None, true);
            }
        }
    };

    let grace = Instant::now() + IO_CAPTURE_TIMEOUT;
    collect(&mut out_rx, &mut stdout, grace).await;
    collect(&mut err_rx, &mut stderr, grace).await;
    cancel.cancel();
    for task in [stdout_task, stderr_task].into_iter().flatten() {
        if let Err(err) = task.await {
            warn!(program = %program, error = %err, "reader task panicked");
        }
    }

    Ok(Captured {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
        timed_out,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

/// SIGKILL the child's process group (the child is its leader).
fn kill_group(child: &tokio::process::Child, program: &str) {
    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(program, pid, error = %err, "process group already gone");
    }
}

/// `sh -c <script>` with an optional working directory.
pub fn shell_command(script: &str, cwd: Option<&std::path::Path>) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd
}

/// `sh -s`, reading the script from stdin. The script text never appears on
/// a command line, so `pkill -f` inside it cannot match its own shell.
pub fn stdin_shell(cwd: Option<&std::path::Path>) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-s");
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd
}
