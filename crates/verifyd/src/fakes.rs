//! In-memory fakes for the collaborator traits (testing only)
//!
//! `FakeTransport` answers commands from substring rules and records every
//! call; `ScriptedAssistant` replays canned replies in order.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::assistant::{self, Assistant, Session};
use crate::process::Captured;
use crate::transport::{self, Transport, TransportError};
use verify_core::Id;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// FakeTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Reply {
    Output(Captured),
    Auth,
    Connection,
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    /// Consumed front to back; the last reply repeats.
    replies: VecDeque<Reply>,
}

/// Transport whose commands are answered by the first rule whose pattern is
/// a substring of the command. Unmatched commands succeed with no output.
#[derive(Debug, Default)]
pub struct FakeTransport {
    rules: Mutex<Vec<Rule>>,
    calls: Arc<Mutex<Vec<String>>>,
    uploads: Arc<Mutex<Vec<(PathBuf, String)>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, pattern: &str, reply: Reply) -> Self {
        {
            let mut rules = lock(&self.rules);
            if let Some(rule) = rules.iter_mut().find(|r| r.pattern == pattern) {
                rule.replies.push_back(reply);
            } else {
                rules.push(Rule {
                    pattern: pattern.to_string(),
                    replies: VecDeque::from([reply]),
                });
            }
        }
        self
    }

    /// Answer with `stdout` and exit 0. Repeated calls for one pattern queue
    /// replies in order.
    pub fn on(self, pattern: &str, stdout: &str) -> Self {
        self.push(
            pattern,
            Reply::Output(Captured {
                stdout: stdout.to_string(),
                exit_code: Some(0),
                ..Captured::default()
            }),
        )
    }

    pub fn on_output(self, pattern: &str, output: Captured) -> Self {
        self.push(pattern, Reply::Output(output))
    }

    pub fn fail_auth(self, pattern: &str) -> Self {
        self.push(pattern, Reply::Auth)
    }

    pub fn fail_connection(self, pattern: &str) -> Self {
        self.push(pattern, Reply::Connection)
    }

    /// Shared handle to the commands seen so far.
    pub fn call_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }

    /// Shared handle to `(local, remote_path)` uploads seen so far.
    pub fn upload_log(&self) -> Arc<Mutex<Vec<(PathBuf, String)>>> {
        Arc::clone(&self.uploads)
    }

    fn answer(&self, command: &str) -> Reply {
        let mut rules = lock(&self.rules);
        let Some(rule) = rules.iter_mut().find(|r| command.contains(&r.pattern)) else {
            return Reply::Output(Captured {
                exit_code: Some(0),
                ..Captured::default()
            });
        };
        if rule.replies.len() > 1 {
            rule.replies.pop_front().unwrap_or(Reply::Connection)
        } else {
            rule.replies.front().cloned().unwrap_or(Reply::Connection)
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn describe(&self) -> String {
        "fake".to_string()
    }

    async fn run(&self, command: &str, _timeout: Duration) -> transport::Result<Captured> {
        lock(&self.calls).push(command.to_string());
        match self.answer(command) {
            Reply::Output(output) => Ok(output),
            Reply::Auth => Err(TransportError::Auth {
                host: "fake".to_string(),
                message: "Permission denied (publickey).".to_string(),
            }),
            Reply::Connection => Err(TransportError::Connection {
                host: "fake".to_string(),
                message: "Connection timed out".to_string(),
            }),
        }
    }

    async fn upload(&self, local: &Path, remote_path: &str) -> transport::Result<()> {
        lock(&self.uploads).push((local.to_path_buf(), remote_path.to_string()));
        Ok(())
    }

    async fn download(&self, _remote_path: &str, _local: &Path) -> transport::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedAssistant
// ---------------------------------------------------------------------------

/// Assistant that replays canned replies in order across all its sessions,
/// then answers with an empty string.
#[derive(Debug, Default)]
pub struct ScriptedAssistant {
    replies: Arc<Mutex<VecDeque<String>>>,
    prompts: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
}

impl ScriptedAssistant {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Arc::new(Mutex::new(replies.into_iter().map(Into::into).collect())),
            ..Self::default()
        }
    }

    /// Sleep before each reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared handle to every instruction received.
    pub fn prompt_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.prompts)
    }
}

#[derive(Debug)]
struct ScriptedSession {
    id: String,
    replies: Arc<Mutex<VecDeque<String>>>,
    prompts: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
}

#[async_trait]
impl Assistant for ScriptedAssistant {
    async fn open_session(&self) -> assistant::Result<Box<dyn Session>> {
        Ok(Box::new(ScriptedSession {
            id: Id::new().to_string(),
            replies: Arc::clone(&self.replies),
            prompts: Arc::clone(&self.prompts),
            delay: self.delay,
        }))
    }
}

#[async_trait]
impl Session for ScriptedSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&mut self, instruction: &str) -> assistant::Result<String> {
        lock(&self.prompts).push(instruction.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(lock(&self.replies).pop_front().unwrap_or_default())
    }
}
