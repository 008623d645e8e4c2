//! Configuration parsing for the verification engine.
//!
//! key=value format read from `.verify/config` or `--config`.
//! Precedence: CLI flags > `--config` file > `.verify/config` > defaults.

use crate::types::TargetSelection;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Engine configuration, passed into each component at construction.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Directories
    /// Root under which per-run directories are created.
    pub workspace_root: PathBuf,

    // Target
    pub target: TargetSelection,
    pub remote_host: Option<String>,
    pub remote_user: Option<String>,
    pub remote_port: u16,
    /// Work directory on the remote machine.
    pub remote_dir: String,
    pub ssh_bin: PathBuf,
    pub scp_bin: PathBuf,

    // Retry budget
    pub max_retries: u32,

    // Timeouts
    pub run_timeout_sec: u32,
    pub command_timeout_sec: u32,
    pub probe_timeout_sec: u32,
    /// Wait after a detached launch before sampling liveness.
    pub settle_delay_sec: u32,
    /// Gap between the two size samples of the file-stability test.
    pub stability_delay_sec: u32,
    pub response_timeout_sec: u32,

    // Assistant
    pub assistant_cmd: Option<String>,
    pub assistant_args: Vec<String>,

    // Execution
    pub execute: bool,
    pub install_missing: bool,
    /// Install template; `{package}` is replaced by the package name.
    pub install_cmd: String,
    pub sweep_artifacts: bool,
    pub probe_context: bool,

    // Suites
    pub max_concurrent_runs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(".verify/runs"),
            target: TargetSelection::Auto,
            remote_host: None,
            remote_user: None,
            remote_port: 22,
            remote_dir: "~/verify".to_string(),
            ssh_bin: PathBuf::from("ssh"),
            scp_bin: PathBuf::from("scp"),
            max_retries: 3,
            run_timeout_sec: 30,
            command_timeout_sec: 15,
            probe_timeout_sec: 15,
            settle_delay_sec: 5,
            stability_delay_sec: 3,
            response_timeout_sec: 600,
            assistant_cmd: None,
            assistant_args: Vec::new(),
            execute: true,
            install_missing: true,
            install_cmd: "python3 -m pip install {package}".to_string(),
            sweep_artifacts: true,
            probe_context: true,
            max_concurrent_runs: 3,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let value = Self::unquote(value.trim());
            self.apply_value(key.trim(), &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    pub fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "workspace_root" => self.workspace_root = PathBuf::from(value),
            "target" => {
                self.target = match value {
                    "auto" => TargetSelection::Auto,
                    "local" => TargetSelection::Local,
                    "remote" => TargetSelection::Remote,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "target must be 'auto', 'local', or 'remote', got '{value}'"
                        )))
                    }
                }
            }
            "remote_host" => self.remote_host = non_empty(value),
            "remote_user" => self.remote_user = non_empty(value),
            "remote_port" => self.remote_port = Self::parse_num(key, value)?,
            "remote_dir" => self.remote_dir = value.to_string(),
            "ssh_bin" => self.ssh_bin = PathBuf::from(value),
            "scp_bin" => self.scp_bin = PathBuf::from(value),
            "max_retries" => self.max_retries = Self::parse_num(key, value)?,
            "run_timeout_sec" => self.run_timeout_sec = Self::parse_num(key, value)?,
            "command_timeout_sec" => self.command_timeout_sec = Self::parse_num(key, value)?,
            "probe_timeout_sec" => self.probe_timeout_sec = Self::parse_num(key, value)?,
            "settle_delay_sec" => self.settle_delay_sec = Self::parse_num(key, value)?,
            "stability_delay_sec" => self.stability_delay_sec = Self::parse_num(key, value)?,
            "response_timeout_sec" => self.response_timeout_sec = Self::parse_num(key, value)?,
            "assistant_cmd" => self.assistant_cmd = non_empty(value),
            "assistant_args" => {
                self.assistant_args = value.split_whitespace().map(str::to_string).collect();
            }
            "execute" => self.execute = Self::parse_bool(key, value)?,
            "install_missing" => self.install_missing = Self::parse_bool(key, value)?,
            "install_cmd" => self.install_cmd = value.to_string(),
            "sweep_artifacts" => self.sweep_artifacts = Self::parse_bool(key, value)?,
            "probe_context" => self.probe_context = Self::parse_bool(key, value)?,
            "max_concurrent_runs" => {
                self.max_concurrent_runs = Self::parse_num(key, value)?;
            }
            _ => {
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Resolve a relative workspace root against a base directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.workspace_root.is_relative() {
            self.workspace_root = base.join(&self.workspace_root);
        }
    }

    /// Render the install command for one package.
    pub fn install_command(&self, package: &str) -> String {
        self.install_cmd.replace("{package}", package)
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
