//! End-to-end runs through the engine with a scripted assistant.
//!
//! Local runs execute real `bash` in a temp workspace; remote runs go
//! through the in-memory transport.

use std::sync::Arc;

use tempfile::TempDir;
use verify_core::report::read_report;
use verify_core::{AttemptStatus, Config, PipelineStatus, RemoteHost, RunRecord, TargetSelection};
use verifyd::assistant::SessionPool;
use verifyd::fakes::{FakeTransport, ScriptedAssistant};
use verifyd::orchestrator::{Orchestrator, RunRequest};
use verifyd::scheduler::{CaseStatus, SuiteCase};
use verifyd::Engine;

fn test_config(root: &TempDir) -> Config {
    Config {
        workspace_root: root.path().join("runs"),
        probe_context: false,
        response_timeout_sec: 5,
        stability_delay_sec: 0,
        settle_delay_sec: 0,
        ..Config::default()
    }
}

#[tokio::test]
async fn create_file_task_passes_acceptance_and_sweeps_output() {
    let root = TempDir::new().unwrap();
    let assistant = ScriptedAssistant::new([
        "Here you go:\n\n```bash\necho 'hello world' > notes.txt\n```\n",
    ]);
    let engine = Engine::with_assistant(test_config(&root), Arc::new(assistant));

    let summary = engine
        .run_task(RunRequest::new(
            r#"create a file called notes.txt containing "hello world""#,
        ))
        .await
        .unwrap();

    assert_eq!(summary.run.status, PipelineStatus::Success);
    let attempt = &summary.run.attempts[0];
    assert!(!attempt.verdicts.is_empty());
    assert!(attempt.verdicts.iter().all(|v| v.verdict.passed), "{:?}", attempt.verdicts);
    assert!(summary.layout.outputs_dir.join("notes.txt").exists());
    assert!(!summary.layout.programs_dir.join("notes.txt").exists());

    let record = RunRecord::read(&summary.layout.record_path()).unwrap();
    assert!(record.files_touched.contains(&"notes.txt".to_string()));

    let kinds: Vec<String> = read_report(&summary.layout.report_path())
        .unwrap()
        .into_iter()
        .map(|r| r.kind)
        .collect();
    assert_eq!(kinds.first().map(String::as_str), Some("RUN_CREATED"));
    assert!(kinds.contains(&"ACCEPTANCE_EVALUATED".to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some("RUN_FINISHED"));
}

#[tokio::test]
async fn contradicting_reply_is_discarded_and_reprompted() {
    let root = TempDir::new().unwrap();
    let config = Config {
        target: TargetSelection::Remote,
        ..test_config(&root)
    };
    let transport = FakeTransport::new()
        .on("pgrep -a python", "4242 python3 counter.py\n")
        .on("pgrep -a python", "")
        .on("stat -c", "64\n64\n");
    let calls = transport.call_log();
    let assistant = ScriptedAssistant::new([
        "```bash\nnohup python3 counter.py > counter_log.txt 2>&1 &\n```",
        "```bash\npkill -f counter.py\n```",
    ]);
    let prompts = assistant.prompt_log();
    let orchestrator = Orchestrator::new(config, SessionPool::new(Arc::new(assistant), 1))
        .with_remote_transport(RemoteHost::new("pi"), Arc::new(transport));

    let summary = orchestrator
        .run(RunRequest::new("kill the infinite counter process"))
        .await
        .unwrap();

    assert_eq!(summary.run.status, PipelineStatus::Success);
    assert_eq!(summary.run.attempts[0].status, AttemptStatus::Contradiction);
    assert_eq!(summary.run.attempts[1].status, AttemptStatus::Success);
    assert!(prompts.lock().unwrap()[1].contains("did the opposite"));

    let calls = calls.lock().unwrap();
    assert!(!calls.iter().any(|c| c.contains("nohup python3 counter.py")));
    assert!(calls.iter().any(|c| c.contains("pkill -f counter.py")));
}

#[tokio::test]
async fn suite_chain_deletes_what_the_first_case_created() {
    let root = TempDir::new().unwrap();
    let assistant = ScriptedAssistant::new([
        "```bash\necho 'keep me' > scratch.txt\n```",
        "```bash\nrm -f scratch.txt\n```",
    ]);
    let engine = Engine::with_assistant(test_config(&root), Arc::new(assistant));
    let cases = vec![
        SuiteCase {
            name: "create".to_string(),
            task: "create a file called scratch.txt".to_string(),
            target: Some(TargetSelection::Local),
            max_retries: Some(0),
            depends_on: None,
        },
        SuiteCase {
            name: "delete".to_string(),
            task: "delete the file scratch.txt".to_string(),
            target: Some(TargetSelection::Local),
            max_retries: Some(0),
            depends_on: Some("create".to_string()),
        },
    ];

    let results = engine.run_suite(&cases).await.unwrap();
    assert_eq!(results[0].status, CaseStatus::Passed, "{:?}", results[0].message);
    assert_eq!(results[1].status, CaseStatus::Passed, "{:?}", results[1].message);
    assert_eq!(engine.scheduler().active_run_count(), 0);
}

#[tokio::test]
async fn exhausted_budget_reports_last_evidence() {
    let root = TempDir::new().unwrap();
    let config = Config {
        max_retries: 1,
        ..test_config(&root)
    };
    let failing = "```bash\necho 'ImportError: nothing here' >&2\nexit 4\n```";
    let engine = Engine::with_assistant(config, Arc::new(ScriptedAssistant::new([failing, failing])));

    let summary = engine.run_task(RunRequest::new("print the weather")).await.unwrap();

    assert_eq!(summary.run.status, PipelineStatus::Failed);
    assert_eq!(summary.run.attempts.len(), 2);
    let reason = summary.reason.unwrap();
    assert!(reason.starts_with("gave up after 2 attempts"), "{reason}");
}
