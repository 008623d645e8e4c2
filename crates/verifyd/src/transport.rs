//! Command transports: where probes and programs actually run.
//!
//! Both transports speak POSIX shell. `LocalTransport` runs `sh -c` on this
//! machine; `SshTransport` shells out to the `ssh`/`scp` binaries in batch
//! mode so an unusable key fails fast instead of prompting.

use crate::process::{self, Captured, ProcessError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use verify_core::shell;
use verify_core::RemoteHost;

/// ssh reserves exit status 255 for its own failures.
const SSH_FAILURE_EXIT: i32 = 255;

/// Timeout for file transfers and the detached launch itself.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);

const AUTH_MARKERS: &[&str] = &[
    "Permission denied",
    "Host key verification failed",
    "REMOTE HOST IDENTIFICATION HAS CHANGED",
    "Too many authentication failures",
    "no matching host key type",
];

#[derive(Debug, Error)]
pub enum TransportError {
    /// Credentials or host identity rejected. Never retried.
    #[error("authentication failed for {host}: {message}")]
    Auth { host: String, message: String },
    #[error("connection to {host} failed: {message}")]
    Connection { host: String, message: String },
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Output of one command on the target.
pub type CommandOutput = Captured;

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Run a shell command, killing it at `timeout`.
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Like [`Transport::run`], but the shell reads `script` from stdin so the
    /// text is not visible in any process's command line.
    async fn run_script(&self, script: &str, timeout: Duration) -> Result<CommandOutput> {
        self.run(script, timeout).await
    }

    /// Copy a local file to `remote_path` on the target.
    async fn upload(&self, local: &Path, remote_path: &str) -> Result<()>;

    /// Copy `remote_path` from the target to a local file.
    async fn download(&self, remote_path: &str, local: &Path) -> Result<()>;

    /// Launch `command` in the background inside `dir`, returning its PID.
    ///
    /// Output goes to `<log_stem>.out` and `<log_stem>.err` in `dir`.
    async fn run_detached(&self, command: &str, dir: &str, log_stem: &str) -> Result<Option<u32>> {
        let script = format!(
            "cd {dir} || exit 1; nohup {command} > {out} 2> {err} < /dev/null & echo $!",
            dir = shell::quote(dir),
            out = shell::quote(&format!("{log_stem}.out")),
            err = shell::quote(&format!("{log_stem}.err")),
        );
        let output = self.run(&script, LAUNCH_TIMEOUT).await?;
        Ok(output
            .stdout
            .lines()
            .rev()
            .find_map(|line| line.trim().parse().ok()))
    }
}

/// Runs commands on this machine.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    cwd: Option<PathBuf>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self { cwd: None }
    }

    /// Run every command from `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(dir.into()),
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// `~/x` on the local side, for symmetry with remote paths.
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn describe(&self) -> String {
        "local".to_string()
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let cmd = process::shell_command(command, self.cwd.as_deref());
        Ok(process::capture(cmd, None, timeout).await?)
    }

    async fn run_script(&self, script: &str, timeout: Duration) -> Result<CommandOutput> {
        let cmd = process::stdin_shell(self.cwd.as_deref());
        Ok(process::capture(cmd, Some(script), timeout).await?)
    }

    async fn upload(&self, local: &Path, remote_path: &str) -> Result<()> {
        let dest = expand_home(remote_path);
        if dest == local {
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &dest).await?;
        Ok(())
    }

    async fn download(&self, remote_path: &str, local: &Path) -> Result<()> {
        let src = expand_home(remote_path);
        if src == local {
            return Ok(());
        }
        tokio::fs::copy(&src, local).await?;
        Ok(())
    }
}

/// Runs commands on a remote host through the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshTransport {
    remote: RemoteHost,
    ssh_bin: PathBuf,
    scp_bin: PathBuf,
    connect_timeout_sec: u32,
}

impl SshTransport {
    pub fn new(remote: RemoteHost) -> Self {
        Self {
            remote,
            ssh_bin: PathBuf::from("ssh"),
            scp_bin: PathBuf::from("scp"),
            connect_timeout_sec: 10,
        }
    }

    pub fn with_binaries(mut self, ssh_bin: impl Into<PathBuf>, scp_bin: impl Into<PathBuf>) -> Self {
        self.ssh_bin = ssh_bin.into();
        self.scp_bin = scp_bin.into();
        self
    }

    fn common_options(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_sec),
        ]
    }

    fn ssh_command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new(&self.ssh_bin);
        cmd.args(self.common_options())
            .arg("-p")
            .arg(self.remote.port.to_string())
            .arg(self.remote.destination())
            .arg(remote_command);
        cmd
    }

    fn scp_command(&self, from: &str, to: &str) -> Command {
        let mut cmd = Command::new(&self.scp_bin);
        cmd.args(self.common_options())
            .arg("-P")
            .arg(self.remote.port.to_string())
            .arg(from)
            .arg(to);
        cmd
    }

    /// scp resolves remote paths relative to the login directory already.
    fn scp_path(remote_path: &str) -> &str {
        remote_path.strip_prefix("~/").unwrap_or(remote_path)
    }

    /// Map ssh's own failures to transport errors; everything else is the
    /// remote command's result.
    fn check(&self, output: &Captured) -> Result<()> {
        classify_ssh_failure(&self.remote.host, output)
    }
}

/// Auth markers on exit 255 are auth errors; other 255s are connection errors.
pub fn classify_ssh_failure(host: &str, output: &Captured) -> Result<()> {
    if output.exit_code != Some(SSH_FAILURE_EXIT) {
        return Ok(());
    }
    let message = output.stderr.trim().to_string();
    if AUTH_MARKERS.iter().any(|m| message.contains(m)) {
        return Err(TransportError::Auth {
            host: host.to_string(),
            message,
        });
    }
    Err(TransportError::Connection {
        host: host.to_string(),
        message,
    })
}

#[async_trait]
impl Transport for SshTransport {
    fn describe(&self) -> String {
        format!("ssh://{}:{}", self.remote.destination(), self.remote.port)
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!(host = %self.remote.host, command, "ssh run");
        let output = process::capture(self.ssh_command(command), None, timeout).await?;
        self.check(&output)?;
        Ok(output)
    }

    async fn run_script(&self, script: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!(host = %self.remote.host, script, "ssh script");
        let output = process::capture(self.ssh_command("sh -s"), Some(script), timeout).await?;
        self.check(&output)?;
        Ok(output)
    }

    async fn upload(&self, local: &Path, remote_path: &str) -> Result<()> {
        let to = format!("{}:{}", self.remote.destination(), Self::scp_path(remote_path));
        let output = process::capture(
            self.scp_command(&local.to_string_lossy(), &to),
            None,
            TRANSFER_TIMEOUT,
        )
        .await?;
        self.check(&output)?;
        if !output.success() {
            return Err(TransportError::Transfer(format!(
                "upload of {} failed: {}",
                local.display(),
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn download(&self, remote_path: &str, local: &Path) -> Result<()> {
        let from = format!("{}:{}", self.remote.destination(), Self::scp_path(remote_path));
        let output = process::capture(
            self.scp_command(&from, &local.to_string_lossy()),
            None,
            TRANSFER_TIMEOUT,
        )
        .await?;
        self.check(&output)?;
        if !output.success() {
            return Err(TransportError::Transfer(format!(
                "download of {remote_path} failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}
