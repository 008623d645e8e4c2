//! Retry orchestrator: drives one pipeline run through its attempts.
//!
//! Each attempt sends an instruction, extracts and classifies the reply,
//! runs the retained units, then evaluates the acceptance tests against
//! snapshots taken around the execution pass. The [`RetryPolicy`] decides
//! whether the run stops or loops with feedback.
//!
//! A run is strictly sequential. Transport and auth failures end the run
//! with an error instead of being folded into attempt outcomes.

use crate::assistant::{AssistantError, SessionLease, SessionPool};
use crate::probe::{ProbeError, ProbePhase, Prober};
use crate::retry::{AttemptPhase, Decision, RetryPolicy};
use crate::runner::{Runner, RunnerConfig, RunnerError};
use crate::transcript::{Transcript, TranscriptError};
use crate::transport::{LocalTransport, SshTransport, Transport, TransportError};
use crate::workspace::{self, RunLayout};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use verify_core::acceptance::{self, AcceptanceTest, GenerateOptions};
use verify_core::events::{
    AcceptanceEvaluatedPayload, AttemptFinishedPayload, AttemptStartedPayload,
    DependencyInstalledPayload, EventPayload, ResponseReceivedPayload, RunCreatedPayload,
    RunFinishedPayload, UnitExecutedPayload, UnitsClassifiedPayload,
};
use verify_core::{
    classify_all, deps, extract, intent, naming, prompt, shell, Attempt, AttemptStatus, CodeUnit, Config,
    ExecutionOutcome, Id, PipelineRun, PipelineStatus, RemoteHost, RunFinalized, Target,
    TargetKind, TargetSelection, TestReport, UnitTag,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("target is remote but no remote_host is configured")]
    NoRemoteHost,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Assistant(#[from] AssistantError),
    #[error(transparent)]
    Transcript(#[from] TranscriptError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Finalized(#[from] RunFinalized),
}

impl PipelineError {
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Transport(err)
            | Self::Probe(ProbeError::Transport(err))
            | Self::Runner(RunnerError::Transport(err)) => err.is_auth(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// One task to verify.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub task: String,
    /// Overrides the configured target selection.
    pub target: Option<TargetSelection>,
    /// Overrides the configured retry budget.
    pub max_retries: Option<u32>,
    /// Execute in an earlier run's programs dir instead of a fresh one.
    pub shared_programs: Option<PathBuf>,
    /// Remote counterpart of `shared_programs`: an earlier run's remote
    /// work dir.
    pub shared_remote_dir: Option<String>,
    /// Leave new files in the programs dir for follow-up runs.
    pub keep_artifacts: bool,
}

impl RunRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }
}

/// Finished run plus where its record lives.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run: PipelineRun,
    pub layout: RunLayout,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    pool: SessionPool,
    local: Arc<dyn Transport>,
    remote: Option<(RemoteHost, Arc<dyn Transport>)>,
}

impl Orchestrator {
    /// Remote runs go through `ssh` when `remote_host` is configured.
    pub fn new(config: Config, pool: SessionPool) -> Self {
        let remote = config
            .remote_host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .map(|host| {
                let remote = RemoteHost {
                    host: host.to_string(),
                    user: config.remote_user.clone(),
                    port: config.remote_port,
                };
                let ssh = SshTransport::new(remote.clone())
                    .with_binaries(config.ssh_bin.clone(), config.scp_bin.clone());
                (remote, Arc::new(ssh) as Arc<dyn Transport>)
            });
        Self {
            config: Arc::new(config),
            pool,
            local: Arc::new(LocalTransport::new()),
            remote,
        }
    }

    pub fn with_local_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.local = transport;
        self
    }

    pub fn with_remote_transport(mut self, remote: RemoteHost, transport: Arc<dyn Transport>) -> Self {
        self.remote = Some((remote, transport));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run a task to a terminal status.
    ///
    /// The run directory is written even when the run ends in an error; the
    /// error is recorded in `run.json` and returned.
    pub async fn run(&self, request: RunRequest) -> Result<RunSummary> {
        let selection = request.target.unwrap_or(self.config.target);
        let kind = intent::select_target(&request.task, selection, self.remote.is_some());
        let remote = match kind {
            TargetKind::Local => None,
            TargetKind::Remote => Some(self.remote.as_ref().ok_or(PipelineError::NoRemoteHost)?),
        };
        let max_retries = request.max_retries.unwrap_or(self.config.max_retries);
        let mut run = PipelineRun::new(
            request.task.clone(),
            Target::local(""),
            intent::detect_intent(&request.task),
            max_retries,
        );
        let layout = RunLayout::create(
            &self.config.workspace_root,
            &run.id,
            request.shared_programs.as_deref(),
        )?;

        let transport = match remote {
            Some((host, transport)) => {
                let work_dir = request
                    .shared_remote_dir
                    .clone()
                    .unwrap_or_else(|| remote_run_dir(&self.config.remote_dir, &run.id));
                run.target = Target::remote(host.clone(), work_dir);
                Arc::clone(transport)
            }
            None => {
                run.target = Target::local(layout.programs_dir.display().to_string());
                Arc::clone(&self.local)
            }
        };

        info!(
            run_id = %run.id,
            target = run.target.kind.as_str(),
            intent = run.intent.as_str(),
            max_retries,
            run_dir = %layout.run_dir.display(),
            "run created"
        );

        let mut transcript = Transcript::create(&layout, &run)?;
        let before_run = workspace::snapshot_local(&layout.programs_dir);
        let mut programs = BTreeSet::new();

        let outcome = self
            .drive(&mut run, &mut transcript, Arc::clone(&transport), &mut programs)
            .await;
        let reason = match outcome {
            Ok(reason) => reason,
            Err(err) => {
                warn!(run_id = %run.id, error = %err, auth = err.is_auth(), "run aborted");
                run.error = Some(err.to_string());
                run.finalize(PipelineStatus::Failed);
                self.finish(&run, &mut transcript, run.error.clone())?;
                return Err(err);
            }
        };

        let sweep = self.config.sweep_artifacts && !request.keep_artifacts;
        if run.target.is_remote() && sweep && request.shared_remote_dir.is_none() {
            self.remove_remote_dir(transport.as_ref(), &run.target.work_dir, &mut transcript)
                .await?;
        }
        if !run.target.is_remote() && sweep {
            let names: Vec<String> = programs.into_iter().collect();
            let moved = workspace::sweep_artifacts(
                &layout.programs_dir,
                &layout.outputs_dir,
                &before_run,
                &names,
            )?;
            if !moved.is_empty() {
                let list: Vec<String> = moved.iter().map(|p| p.display().to_string()).collect();
                transcript.section("Artifacts moved to outputs", &list.join("\n"))?;
            }
        }

        self.finish(&run, &mut transcript, reason.clone())?;
        Ok(RunSummary { run, layout, reason })
    }

    /// Removal failures are logged, not returned.
    async fn remove_remote_dir(
        &self,
        transport: &dyn Transport,
        work_dir: &str,
        transcript: &mut Transcript,
    ) -> Result<()> {
        let command = format!("rm -rf {}", shell::quote(work_dir));
        let removed = match transport.run(&command, secs(self.config.probe_timeout_sec)).await {
            Ok(output) => output.success(),
            Err(err) => {
                warn!(work_dir, error = %err, "could not remove remote run dir");
                false
            }
        };
        debug!(work_dir, removed, "remote run dir cleanup");
        if removed {
            transcript.note(&format!("Removed remote run dir `{work_dir}`."))?;
        }
        Ok(())
    }

    fn finish(&self, run: &PipelineRun, transcript: &mut Transcript, reason: Option<String>) -> Result<()> {
        let attempts = u32::try_from(run.attempts.len()).unwrap_or(u32::MAX);
        transcript.note(&format!(
            "**Final status: {}** after {attempts} attempt(s){}",
            run.status.as_str(),
            reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default()
        ))?;
        transcript.event(&EventPayload::RunFinished(RunFinishedPayload {
            run_id: run.id.clone(),
            status: run.status,
            attempts,
            reason,
        }))?;
        transcript.write_record(run, &self.config)?;
        info!(run_id = %run.id, status = run.status.as_str(), attempts, "run finished");
        Ok(())
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        transcript: &mut Transcript,
        transport: Arc<dyn Transport>,
        programs: &mut BTreeSet<String>,
    ) -> Result<Option<String>> {
        let tests = acceptance::generate(
            &run.task,
            &run.target,
            GenerateOptions {
                stability_delay_sec: self.config.stability_delay_sec,
            },
        );
        transcript.event(&EventPayload::RunCreated(RunCreatedPayload {
            run_id: run.id.clone(),
            target: run.target.kind,
            intent: run.intent,
            max_retries: run.max_retries,
            tests: tests.iter().map(|t| t.name.clone()).collect(),
        }))?;
        if !tests.is_empty() {
            transcript.section("Acceptance tests", &describe_tests(&tests))?;
        }

        if run.target.is_remote() {
            let mkdir = format!("mkdir -p {}", shell::quote(&run.target.work_dir));
            transport.run(&mkdir, secs(self.config.probe_timeout_sec)).await?;
        }

        let prober = Prober::new(
            Arc::clone(&transport),
            secs(self.config.probe_timeout_sec),
        );
        let runner = Runner::new(
            transport,
            run.target.clone(),
            transcript.layout().programs_dir.clone(),
            RunnerConfig::from_config(&self.config),
        );
        let mut lease = self.pool.lease().await?;
        debug!(run_id = %run.id, session_id = lease.id(), "session leased");

        let context = if self.config.probe_context {
            Some(prober.system_context(&run.target).await?)
        } else {
            None
        };

        let mut ctx = AttemptContext {
            task: run.task.clone(),
            run_id: run.id.clone(),
            tests,
            prober,
            runner,
            transcript,
            lease: &mut lease,
            installed: BTreeSet::new(),
            programs,
        };

        let policy = RetryPolicy::new(run.max_retries);
        let mut instruction = prompt::initial_prompt(&run.task, &run.target, context.as_deref());
        loop {
            let ordinal = u32::try_from(run.attempts.len()).unwrap_or(u32::MAX).saturating_add(1);
            let attempt = self.attempt(&mut ctx, ordinal, instruction).await?;
            let decision = policy.decide(&run.task, &attempt);
            ctx.transcript.event(&EventPayload::AttemptFinished(AttemptFinishedPayload {
                attempt: ordinal,
                status: attempt.status,
                retrying: decision.is_retry(),
            }))?;
            run.record(attempt)?;
            match decision {
                Decision::Stop { status, reason } => {
                    run.finalize(status);
                    return Ok(reason);
                }
                Decision::Retry { instruction: next } => {
                    ctx.transcript.section("Feedback", &next)?;
                    instruction = next;
                }
            }
        }
    }

    async fn attempt(
        &self,
        ctx: &mut AttemptContext<'_>,
        ordinal: u32,
        instruction: String,
    ) -> Result<Attempt> {
        let started_at = Utc::now();
        info!(run_id = %ctx.run_id, attempt = ordinal, "attempt started");
        ctx.transcript.heading(&format!("Attempt {ordinal}"))?;
        ctx.transcript.section("Instruction", &instruction)?;
        ctx.transcript.event(&EventPayload::AttemptStarted(AttemptStartedPayload {
            run_id: ctx.run_id.clone(),
            attempt: ordinal,
            instruction_chars: instruction.chars().count(),
        }))?;

        let mut attempt = Attempt {
            ordinal,
            instruction,
            response: String::new(),
            units: Vec::new(),
            warnings: Vec::new(),
            outcomes: Vec::new(),
            verdicts: Vec::new(),
            status: AttemptStatus::Failed,
            started_at,
            ended_at: started_at,
        };

        // Prompting
        phase(ctx, ordinal, AttemptPhase::Prompting);
        let sent = Instant::now();
        let timeout = secs(self.config.response_timeout_sec);
        let response = match tokio::time::timeout(timeout, ctx.lease.send(&attempt.instruction)).await {
            Ok(reply) => reply?,
            Err(_) => {
                warn!(
                    run_id = %ctx.run_id,
                    attempt = ordinal,
                    timeout_sec = self.config.response_timeout_sec,
                    "no response within timeout"
                );
                String::new()
            }
        };
        let response_ms = elapsed_ms(sent);
        ctx.transcript.section(
            "Response",
            if response.trim().is_empty() { "(empty response)" } else { response.as_str() },
        )?;

        // Extracting
        phase(ctx, ordinal, AttemptPhase::Extracting);
        let extraction = extract(&response);
        attempt.response = response;
        ctx.transcript.event(&EventPayload::ResponseReceived(ResponseReceivedPayload {
            attempt: ordinal,
            response_chars: attempt.response.chars().count(),
            blocks: extraction.blocks.len(),
            recovered: extraction.recovered,
            duration_ms: response_ms,
        }))?;
        if extraction.blocks.is_empty() {
            ctx.transcript.note("No code blocks found in the response.")?;
            return Ok(finish_attempt(attempt, AttemptStatus::NoCode));
        }

        // Classifying
        phase(ctx, ordinal, AttemptPhase::Classifying);
        let classification = classify_all(&ctx.task, &extraction.blocks);
        attempt.units.clone_from(&classification.units);
        attempt.warnings.clone_from(&classification.warnings);
        let count = |tag: UnitTag| classification.units.iter().filter(|u| u.tag == tag).count();
        ctx.transcript.event(&EventPayload::UnitsClassified(UnitsClassifiedPayload {
            attempt: ordinal,
            programs: count(UnitTag::Program),
            commands: count(UnitTag::DirectCommand),
            discarded: count(UnitTag::Discard),
            forced: classification.units.iter().any(|u| u.forced),
            warnings: classification.warnings.clone(),
        }))?;
        ctx.transcript.section("Classification", &describe_units(&classification.units, &classification.warnings))?;

        if classification.contradiction {
            warn!(run_id = %ctx.run_id, attempt = ordinal, "every runnable unit contradicts the task");
            return Ok(finish_attempt(attempt, AttemptStatus::Contradiction));
        }
        if !classification.has_retained() {
            return Ok(finish_attempt(attempt, AttemptStatus::Failed));
        }
        if !self.config.execute {
            ctx.transcript.note("Execution disabled; nothing was run.")?;
            return Ok(finish_attempt(attempt, AttemptStatus::NoRun));
        }

        // Executing
        phase(ctx, ordinal, AttemptPhase::Executing);
        for package in &extraction.hints.install {
            self.install(ctx, ordinal, package).await?;
        }

        let program_units: Vec<&CodeUnit> = classification
            .retained()
            .filter(|u| u.tag == UnitTag::Program)
            .collect();
        let filenames: HashMap<usize, String> = program_units
            .iter()
            .map(|u| u.ordinal)
            .zip(naming::assign_filenames(
                &program_units,
                &ctx.task,
                &extraction.hints.filenames,
            ))
            .collect();
        ctx.programs.extend(filenames.values().cloned());
        for unit in &program_units {
            if let Some(filename) = filenames.get(&unit.ordinal) {
                ctx.runner.stage(unit, filename).await?;
            }
        }

        // Program files are already in place, so they are not mistaken for
        // files the run created.
        let pre = ctx.prober.capture(&ctx.tests, ProbePhase::Pre).await?;

        let detach = ctx.runner.target().is_remote() && intent::is_long_running(&ctx.task);
        let timeout_sec = extraction.hints.timeout_sec;

        for unit in classification.retained() {
            let filename = filenames.get(&unit.ordinal).map(String::as_str);
            let mut outcome = execute(&ctx.runner, unit, filename, timeout_sec, detach).await?;

            if !outcome.success && self.config.install_missing && !outcome.missing_modules.is_empty() {
                let mut installed_any = false;
                for module in outcome.missing_modules.clone() {
                    let package = deps::package_for(&module);
                    installed_any |= self.install(ctx, ordinal, &package).await?;
                }
                if installed_any {
                    info!(run_id = %ctx.run_id, attempt = ordinal, unit = unit.ordinal, "re-running after install");
                    outcome = execute(&ctx.runner, unit, filename, timeout_sec, detach).await?;
                }
            }

            ctx.transcript.event(&EventPayload::UnitExecuted(UnitExecutedPayload {
                attempt: ordinal,
                unit: unit.ordinal,
                label: outcome.label.clone(),
                success: outcome.success,
                exit_code: outcome.exit_code,
                timed_out: outcome.timed_out,
                tentative: outcome.tentative,
                duration_ms: outcome.duration_ms,
            }))?;
            ctx.transcript
                .section(&format!("Execution: {}", outcome.label), &describe_outcome(&outcome))?;
            attempt.outcomes.push(outcome);
        }

        // Saved-only units neither pass nor fail an attempt.
        let ran_any = attempt.outcomes.iter().any(|o| !o.skipped);
        if !ran_any {
            ctx.transcript.note("None of the retained units could be executed.")?;
            return Ok(finish_attempt(attempt, AttemptStatus::Failed));
        }
        if !attempt.outcomes.iter().filter(|o| !o.skipped).all(|o| o.success) {
            return Ok(finish_attempt(attempt, AttemptStatus::Failed));
        }
        if ctx.tests.is_empty() {
            return Ok(finish_attempt(attempt, AttemptStatus::Success));
        }

        // Testing
        phase(ctx, ordinal, AttemptPhase::Testing);
        let post = ctx.prober.capture(&ctx.tests, ProbePhase::Post).await?;
        let reports = acceptance::evaluate(&ctx.tests, &pre, &post);
        let failed: Vec<String> = reports
            .iter()
            .filter(|r| !r.verdict.passed)
            .map(|r| r.name.clone())
            .collect();
        ctx.transcript.event(&EventPayload::AcceptanceEvaluated(AcceptanceEvaluatedPayload {
            attempt: ordinal,
            passed: reports.len() - failed.len(),
            failed: failed.clone(),
        }))?;
        ctx.transcript.section("Acceptance results", &describe_reports(&reports))?;
        info!(
            run_id = %ctx.run_id,
            attempt = ordinal,
            passed = reports.len() - failed.len(),
            failed = failed.len(),
            "acceptance tests evaluated"
        );

        let status = if failed.is_empty() {
            AttemptStatus::Success
        } else {
            AttemptStatus::Failed
        };
        attempt.verdicts = reports;
        Ok(finish_attempt(attempt, status))
    }

    /// Install a package once per run. Returns whether this call installed it.
    async fn install(&self, ctx: &mut AttemptContext<'_>, ordinal: u32, package: &str) -> Result<bool> {
        if !ctx.installed.insert(package.to_string()) {
            debug!(package, "already attempted this run");
            return Ok(false);
        }
        let success = ctx.runner.install(package).await?;
        ctx.transcript.event(&EventPayload::DependencyInstalled(DependencyInstalledPayload {
            attempt: ordinal,
            package: package.to_string(),
            success,
        }))?;
        ctx.transcript.note(&format!(
            "Install `{package}`: {}",
            if success { "ok" } else { "failed" }
        ))?;
        Ok(success)
    }
}

/// Per-run state threaded through attempts.
struct AttemptContext<'a> {
    task: String,
    run_id: Id,
    tests: Vec<AcceptanceTest>,
    prober: Prober,
    runner: Runner,
    transcript: &'a mut Transcript,
    lease: &'a mut SessionLease,
    installed: BTreeSet<String>,
    programs: &'a mut BTreeSet<String>,
}

/// Programs go through their staged file; everything else is a direct
/// command.
async fn execute(
    runner: &Runner,
    unit: &CodeUnit,
    filename: Option<&str>,
    timeout_sec: Option<u32>,
    detach: bool,
) -> Result<ExecutionOutcome> {
    let outcome = match filename {
        Some(filename) => runner.run_staged(unit, filename, timeout_sec, detach).await?,
        None => runner.run_command(unit).await?,
    };
    Ok(outcome)
}

/// Per-run directory under the configured remote root.
fn remote_run_dir(remote_root: &str, id: &Id) -> String {
    format!("{}/run-{id}", remote_root.trim_end_matches('/'))
}

fn phase(ctx: &AttemptContext<'_>, attempt: u32, phase: AttemptPhase) {
    debug!(run_id = %ctx.run_id, attempt, phase = phase.as_str(), "attempt phase");
}

fn finish_attempt(mut attempt: Attempt, status: AttemptStatus) -> Attempt {
    attempt.status = status;
    attempt.ended_at = Utc::now();
    attempt
}

fn secs(value: u32) -> Duration {
    Duration::from_secs(u64::from(value))
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn describe_tests(tests: &[AcceptanceTest]) -> String {
    tests
        .iter()
        .map(|t| format!("{} [{}]", t.name, t.intent.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_units(units: &[CodeUnit], warnings: &[String]) -> String {
    let mut lines: Vec<String> = units
        .iter()
        .map(|u| {
            format!(
                "#{} {} -> {} ({}{})",
                u.ordinal + 1,
                if u.language.is_empty() { "untagged" } else { u.language.as_str() },
                u.tag.as_str(),
                u.rule,
                if u.forced { ", forced" } else { "" }
            )
        })
        .collect();
    lines.extend(warnings.iter().map(|w| format!("warning: {w}")));
    lines.join("\n")
}

fn describe_outcome(outcome: &ExecutionOutcome) -> String {
    let mut lines = vec![format!(
        "success={} exit_code={} timed_out={} tentative={} detached={} duration_ms={}",
        outcome.success,
        outcome
            .exit_code
            .map_or_else(|| "none".to_string(), |c| c.to_string()),
        outcome.timed_out,
        outcome.tentative,
        outcome.detached,
        outcome.duration_ms
    )];
    if let Some(error) = &outcome.error {
        lines.push(format!("error: {error}"));
    }
    if let Some(note) = &outcome.note {
        lines.push(format!("note: {note}"));
    }
    if !outcome.files_changed.is_empty() {
        lines.push(format!("files changed: {}", outcome.files_changed.join(", ")));
    }
    if !outcome.stdout.trim().is_empty() {
        lines.push("--- stdout ---".to_string());
        lines.push(outcome.stdout.trim_end().to_string());
    }
    if !outcome.stderr.trim().is_empty() {
        lines.push("--- stderr ---".to_string());
        lines.push(outcome.stderr.trim_end().to_string());
    }
    lines.join("\n")
}

fn describe_reports(reports: &[TestReport]) -> String {
    reports
        .iter()
        .map(|r| {
            let mut line = format!(
                "{} {}: {}",
                if r.verdict.passed { "PASS" } else { "FAIL" },
                r.name,
                r.verdict.reason
            );
            for (key, value) in &r.verdict.evidence {
                line.push_str(&format!("\n    {key}: {value}"));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}
