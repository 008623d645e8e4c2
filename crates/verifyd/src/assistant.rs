//! Code-generation assistant collaborator.
//!
//! The engine only needs isolated conversations: open a session, send an
//! instruction, get text back. Concurrency is bounded by a [`SessionPool`]
//! that hands out one lease per pipeline run.

use crate::process::{self, ProcessError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use verify_core::{Config, Id};

/// Environment variables exported to the assistant command.
pub const SESSION_ENV: &str = "VERIFY_SESSION_ID";
pub const TURN_ENV: &str = "VERIFY_TURN";

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("no assistant command configured (set assistant_cmd)")]
    NotConfigured,
    #[error("assistant command exited with {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("session pool closed")]
    PoolClosed,
}

pub type Result<T> = std::result::Result<T, AssistantError>;

/// One isolated conversation.
#[async_trait]
pub trait Session: Send + std::fmt::Debug {
    fn id(&self) -> &str;

    /// Send an instruction and wait for the full reply.
    async fn send(&mut self, instruction: &str) -> Result<String>;
}

#[async_trait]
pub trait Assistant: Send + Sync + std::fmt::Debug {
    async fn open_session(&self) -> Result<Box<dyn Session>>;
}

/// Bounded source of sessions.
#[derive(Debug, Clone)]
pub struct SessionPool {
    assistant: Arc<dyn Assistant>,
    permits: Arc<Semaphore>,
}

impl SessionPool {
    pub fn new(assistant: Arc<dyn Assistant>, max_sessions: usize) -> Self {
        Self {
            assistant,
            permits: Arc::new(Semaphore::new(max_sessions.max(1))),
        }
    }

    /// Wait for a free slot and open a fresh session in it.
    pub async fn lease(&self) -> Result<SessionLease> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| AssistantError::PoolClosed)?;
        let session = self.assistant.open_session().await?;
        debug!(session_id = session.id(), available = self.permits.available_permits(), "session leased");
        Ok(SessionLease {
            session,
            _permit: permit,
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// A session plus its pool slot; the slot is released on drop.
#[derive(Debug)]
pub struct SessionLease {
    session: Box<dyn Session>,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn id(&self) -> &str {
        self.session.id()
    }

    pub async fn send(&mut self, instruction: &str) -> Result<String> {
        self.session.send(instruction).await
    }
}

/// Runs an external command once per turn with the instruction on stdin.
///
/// The session id and turn number are exported so the command can keep
/// its own conversation state between turns.
#[derive(Debug, Clone)]
pub struct CommandAssistant {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAssistant {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let program = config
            .assistant_cmd
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or(AssistantError::NotConfigured)?;
        Ok(Self::new(
            program,
            config.assistant_args.clone(),
            Duration::from_secs(u64::from(config.response_timeout_sec)),
        ))
    }
}

#[async_trait]
impl Assistant for CommandAssistant {
    async fn open_session(&self) -> Result<Box<dyn Session>> {
        let id = Id::new().to_string();
        info!(session_id = %id, program = %self.program, "opening assistant session");
        Ok(Box::new(CommandSession {
            id,
            turn: 0,
            program: self.program.clone(),
            args: self.args.clone(),
            timeout: self.timeout,
        }))
    }
}

#[derive(Debug)]
struct CommandSession {
    id: String,
    turn: u32,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

#[async_trait]
impl Session for CommandSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&mut self, instruction: &str) -> Result<String> {
        self.turn += 1;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(SESSION_ENV, &self.id)
            .env(TURN_ENV, self.turn.to_string());

        let output = process::capture(cmd, Some(instruction), self.timeout).await?;
        if output.timed_out {
            // Incomplete reply; extraction decides whether it is usable.
            warn!(
                session_id = %self.id,
                turn = self.turn,
                timeout_sec = self.timeout.as_secs(),
                "assistant reply timed out"
            );
            return Ok(output.stdout);
        }
        if output.exit_code != Some(0) {
            return Err(AssistantError::Failed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        debug!(
            session_id = %self.id,
            turn = self.turn,
            reply_chars = output.stdout.len(),
            duration_ms = output.duration_ms,
            "assistant replied"
        );
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedAssistant;

    fn echo_assistant(script: &str) -> CommandAssistant {
        CommandAssistant::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn command_session_exports_id_and_turn() {
        let assistant = echo_assistant(r#"echo "$VERIFY_SESSION_ID:$VERIFY_TURN:$(cat)""#);
        let mut session = assistant.open_session().await.unwrap();
        let first = session.send("hello").await.unwrap();
        let second = session.send("again").await.unwrap();
        let id = session.id().to_string();
        assert_eq!(first.trim(), format!("{id}:1:hello"));
        assert_eq!(second.trim(), format!("{id}:2:again"));
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let assistant = echo_assistant("echo $VERIFY_SESSION_ID");
        let a = assistant.open_session().await.unwrap();
        let b = assistant.open_session().await.unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let assistant = echo_assistant("echo nope >&2; exit 2");
        let mut session = assistant.open_session().await.unwrap();
        let err = session.send("x").await.unwrap_err();
        assert!(matches!(err, AssistantError::Failed { exit_code: Some(2), .. }));
    }

    #[tokio::test]
    async fn timed_out_reply_is_partial() {
        let assistant = CommandAssistant::new(
            "sh",
            vec!["-c".to_string(), "echo partial; sleep 10".to_string()],
            Duration::from_millis(300),
        );
        let mut session = assistant.open_session().await.unwrap();
        assert_eq!(session.send("x").await.unwrap(), "partial\n");
    }

    #[test]
    fn from_config_requires_command() {
        let config = Config::default();
        assert!(matches!(
            CommandAssistant::from_config(&config),
            Err(AssistantError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn pool_bounds_concurrent_leases() {
        let pool = SessionPool::new(Arc::new(ScriptedAssistant::new(["a", "b"])), 1);
        let mut lease = pool.lease().await.unwrap();
        assert_eq!(pool.available(), 0);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), pool.lease())
                .await
                .is_err()
        );
        assert_eq!(lease.send("first").await.unwrap(), "a");
        drop(lease);
        assert_eq!(pool.available(), 1);
        let mut next = pool.lease().await.unwrap();
        assert_eq!(next.send("second").await.unwrap(), "b");
    }
}
