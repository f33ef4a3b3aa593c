//! End-to-end tests for the job orchestrator
//!
//! Jobs are real descriptor files in a temporary workspace and every run
//! spawns the `mock_target` binary through the default engine executor.

use std::fs;
use std::path::Path;
use std::time::Duration;

use harness::common::config::Config;
use harness::orchestrator::{DirJobSource, JobEvent, JobOutcome, JsonHistory};
use harness::{Error, Orchestrator, Origin};
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("jobs")).unwrap();
        fs::create_dir_all(dir.path().join("suite")).unwrap();
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn job(&self, name: &str, descriptor: serde_json::Value) {
        let mut descriptor = descriptor;
        descriptor["binaryPath"] = env!("CARGO_BIN_EXE_mock_target").into();
        fs::write(
            self.root().join("jobs").join(format!("{}.json", name)),
            serde_json::to_string_pretty(&descriptor).unwrap(),
        )
        .unwrap();
    }

    fn scenario(&self, relative: &str, command: &str) {
        let content = format!(
            r#"
name: {command} check
steps:
  - name: Send {command}
    args:
      Command: {command}
    extract:
      - name: result
        pattern: Result
        variable: RESULT_CODE
    test:
      - RESULT_CODE == 0
"#
        );
        fs::write(self.root().join(relative), content).unwrap();
    }

    fn orchestrator(&self) -> Orchestrator {
        let mut config = Config::default();
        config.orchestrator.batch_concurrency = 2;
        config.orchestrator.cooldown_ms = 10;
        config.orchestrator.dispatch_gap_ms = 5;
        config.engine.timeout_ms = 10_000;

        Orchestrator::builder(config)
            .jobs(DirJobSource::new(self.root().join("jobs")))
            .history(JsonHistory::new(self.root().join("history.json"), 50))
            .build()
    }
}

#[tokio::test]
async fn test_plain_job_runs_target() {
    let ws = Workspace::new();
    ws.job("ping", serde_json::json!({ "arguments": { "Command": "ping", "Count": 3 } }));
    let orch = ws.orchestrator();

    let report = orch.submit("ping", Origin::Adhoc).unwrap().wait().await.unwrap();

    assert!(report.success);
    assert_eq!(report.exit_code, 0);
    match &report.outcome {
        JobOutcome::Plain(response) => {
            assert_eq!(response.command_line, "Command=ping;Count=3");
            assert_eq!(response.field("count"), Some("3"));
        }
        other => panic!("Expected plain outcome, got {:?}", other),
    }

    let status = orch.get_status();
    assert!(status.running.is_none());
    assert!(status.active.is_empty());
}

#[tokio::test]
async fn test_plain_job_exit_code_is_reported() {
    let ws = Workspace::new();
    ws.job("broken", serde_json::json!({ "arguments": { "Command": "query", "exit": 4 } }));
    let orch = ws.orchestrator();

    let report = orch.submit("broken", Origin::Adhoc).unwrap().wait().await.unwrap();

    assert!(!report.success);
    assert_eq!(report.exit_code, 4);
}

#[tokio::test]
async fn test_scenario_job_from_collection_file() {
    let ws = Workspace::new();
    ws.scenario("login.yaml", "login");
    ws.job(
        "login",
        serde_json::json!({ "type": "scenario", "collection": "login.yaml" }),
    );
    let orch = ws.orchestrator();

    let report = orch.submit("login", Origin::Adhoc).unwrap().wait().await.unwrap();

    assert!(report.success);
    match &report.outcome {
        JobOutcome::Scenario(result) => {
            assert_eq!(result.info.name, "login check");
            assert_eq!(result.summary.total, 1);
        }
        other => panic!("Expected scenario outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_batch_continues_past_failing_file() {
    let ws = Workspace::new();
    for (i, command) in ["query", "query", "fail", "query", "query"].iter().enumerate() {
        ws.scenario(&format!("suite/{:02}.yaml", i + 1), command);
    }
    ws.job(
        "suite",
        serde_json::json!({ "type": "scenario", "collection": "suite" }),
    );
    let orch = ws.orchestrator();
    let mut events = orch.subscribe();

    let handle = orch.submit("suite", Origin::Adhoc).unwrap();
    assert!(orch.get_status().batch_mode);
    let report = handle.wait().await.unwrap();

    assert!(!report.success);
    assert_eq!(report.exit_code, 1);
    let batch = match &report.outcome {
        JobOutcome::Batch(batch) => batch,
        other => panic!("Expected batch outcome, got {:?}", other),
    };
    assert_eq!(batch.total, 5);
    assert_eq!(batch.passed, 4);
    assert_eq!(batch.failed, 1);
    assert!(!batch.entries[2].success);
    assert!(batch.entries[2].file.ends_with("03.yaml"));

    let status = orch.get_status();
    assert!(!status.batch_mode);
    assert!(status.running.is_none());
    assert!(status.active.is_empty());

    let mut progress = 0;
    let mut done = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            JobEvent::BatchProgress { total, .. } => {
                assert_eq!(total, 5);
                progress += 1;
            }
            JobEvent::Done { .. } => done += 1,
            _ => {}
        }
    }
    assert_eq!(progress, 5);
    assert_eq!(done, 3);
}

#[tokio::test]
async fn test_second_adhoc_submission_is_rejected() {
    let ws = Workspace::new();
    ws.job("slow", serde_json::json!({ "arguments": { "sleep_ms": 500 } }));
    let orch = ws.orchestrator();

    let first = orch.submit("slow", Origin::Adhoc).unwrap();
    match orch.submit("slow", Origin::Adhoc) {
        Err(Error::AlreadyRunning { running }) => assert_eq!(running, "slow"),
        other => panic!("Expected AlreadyRunning, got {:?}", other.map(|h| h.run_id())),
    }

    assert!(first.wait().await.unwrap().success);
    let again = orch.submit("slow", Origin::Adhoc).unwrap();
    assert!(again.wait().await.unwrap().success);
}

#[tokio::test]
async fn test_unknown_job_is_rejected_without_state_change() {
    let ws = Workspace::new();
    let orch = ws.orchestrator();

    assert!(matches!(
        orch.submit("missing", Origin::Adhoc),
        Err(Error::JobNotFound(_))
    ));
    assert!(orch.get_status().running.is_none());
}

#[tokio::test]
async fn test_queued_job_runs_and_lands_in_history() {
    let ws = Workspace::new();
    ws.job("nightly", serde_json::json!({ "arguments": { "Command": "sync" } }));
    let orch = ws.orchestrator();

    assert!(orch.enqueue("nightly"));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let entries = loop {
        let entries = orch.history(10).unwrap();
        if !entries.is_empty() {
            break entries;
        }
        assert!(tokio::time::Instant::now() < deadline, "queued job never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(entries[0].job, "nightly");
    assert_eq!(entries[0].origin, "scheduled");
    assert!(entries[0].success);
    assert_eq!(orch.get_status().queue.length, 0);
}
