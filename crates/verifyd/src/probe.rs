//! Snapshot prober: read-only probe commands against a target.

use crate::transport::{Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use verify_core::acceptance::{self, AcceptanceTest, Snapshot};
use verify_core::{shell, Target};

#[derive(Debug, Error)]
pub enum ProbeError {
    /// A probe that could not run. Snapshots never record a missing
    /// observation as empty output.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, ProbeError>;

/// Which side of the execution a snapshot is taken on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    Pre,
    Post,
}

impl ProbePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Prober {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl Prober {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Run one probe and return its stdout.
    pub async fn run_probe(&self, command: &str) -> Result<String> {
        let output = self.transport.run(command, self.timeout).await?;
        if output.timed_out {
            warn!(command, timeout_sec = self.timeout.as_secs(), "probe timed out; keeping partial output");
        }
        Ok(output.stdout)
    }

    /// Like [`Prober::run_probe`], but a non-auth failure reads as empty.
    /// Only for informational output, never for snapshots.
    async fn run_lenient(&self, command: &str) -> Result<String> {
        match self.run_probe(command).await {
            Err(ProbeError::Transport(err)) if !err.is_auth() => {
                warn!(command, error = %err, "context probe failed; leaving it out");
                Ok(String::new())
            }
            other => other,
        }
    }

    /// Capture one phase of every test's probes.
    pub async fn capture(&self, tests: &[AcceptanceTest], phase: ProbePhase) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new();
        for test in tests {
            let probes = match phase {
                ProbePhase::Pre => &test.pre_probes,
                ProbePhase::Post => &test.post_probes,
            };
            let mut outputs = Vec::with_capacity(probes.len());
            for probe in probes {
                outputs.push(self.run_probe(probe).await?);
            }
            debug!(test = %test.name, phase = phase.as_str(), probes = outputs.len(), "snapshot captured");
            snapshot.insert(test.name.clone(), outputs);
        }
        Ok(snapshot)
    }

    /// Live description of the target for the first instruction.
    pub async fn system_context(&self, target: &Target) -> Result<String> {
        let dir = shell::quote(target.work_dir.trim_end_matches('/'));
        let probes = [
            ("hostname", "hostname".to_string()),
            ("kernel", "uname -srm".to_string()),
            ("python version", "python3 --version 2>&1".to_string()),
            ("disk usage", "df -h / 2>/dev/null | tail -1".to_string()),
            ("memory", "free -h 2>/dev/null | grep Mem".to_string()),
            ("working dir", format!("ls -la {dir}/ 2>/dev/null | tail -25")),
            ("running python", acceptance::process_probe()),
        ];

        let mut lines = vec!["SYSTEM CONTEXT (probed just now):".to_string()];
        for (label, command) in probes {
            let output = self.run_lenient(&command).await?;
            let output = output.trim();
            if output.is_empty() {
                lines.push(format!("- {label}: (unavailable)"));
            } else if output.lines().count() == 1 {
                lines.push(format!("- {label}: {output}"));
            } else {
                lines.push(format!("- {label}:"));
                lines.extend(output.lines().map(|l| format!("    {l}")));
            }
        }
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeTransport;
    use verify_core::acceptance::{generate, GenerateOptions};

    fn prober(transport: FakeTransport) -> Prober {
        Prober::new(Arc::new(transport), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn capture_runs_phase_probes_per_test() {
        let transport = FakeTransport::new()
            .on("pgrep -a python", "101 python3 counter.py\n")
            .on("stat -c", "10\n10\n");
        let calls = transport.call_log();
        let tests = generate(
            "kill the infinite counter process",
            &Target::local("/tmp/w"),
            GenerateOptions { stability_delay_sec: 0 },
        );
        let prober = prober(transport);

        let pre = prober.capture(&tests, ProbePhase::Pre).await.unwrap();
        assert_eq!(pre[&tests[0].name], vec!["101 python3 counter.py\n"]);
        assert!(pre[&tests[1].name].is_empty());

        let post = prober.capture(&tests, ProbePhase::Post).await.unwrap();
        assert_eq!(post[&tests[1].name], vec!["10\n10\n"]);
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn connection_loss_during_capture_is_an_error() {
        let transport = FakeTransport::new()
            .on("pgrep -a python", "4242 python3 counter.py\n")
            .fail_connection("pgrep -a python");
        let tests = generate(
            "kill the infinite counter process",
            &Target::local("/tmp/w"),
            GenerateOptions { stability_delay_sec: 0 },
        );
        let prober = prober(transport);

        let pre = prober.capture(&tests, ProbePhase::Pre).await.unwrap();
        assert_eq!(pre[&tests[0].name], vec!["4242 python3 counter.py\n"]);
        let err = prober.capture(&tests, ProbePhase::Post).await.unwrap_err();
        let ProbeError::Transport(inner) = err;
        assert!(!inner.is_auth());
    }

    #[tokio::test]
    async fn system_context_tolerates_unreachable_probes() {
        let prober = prober(FakeTransport::new().fail_connection("ls -la"));
        let context = prober.system_context(&Target::local("/tmp")).await.unwrap();
        assert!(context.contains("- working dir: (unavailable)"));
    }

    #[tokio::test]
    async fn auth_failure_propagates() {
        let prober = prober(FakeTransport::new().fail_auth("pgrep"));
        let err = prober.run_probe(&acceptance::process_probe()).await.unwrap_err();
        let ProbeError::Transport(inner) = err;
        assert!(inner.is_auth());
    }

    #[tokio::test]
    async fn system_context_lists_probes() {
        let prober = prober(
            FakeTransport::new()
                .on("hostname", "raspberrypi\n")
                .on("ls -la", "total 0\n-rw-r--r-- 1 pi pi 0 Jan 1 00:00 a.txt\n"),
        );
        let context = prober
            .system_context(&Target::local("/home/pi/work"))
            .await
            .unwrap();
        assert!(context.starts_with("SYSTEM CONTEXT"));
        assert!(context.contains("- hostname: raspberrypi"));
        assert!(context.contains("- working dir:\n    total 0"));
        assert!(context.contains("- kernel: (unavailable)"));
    }
}
