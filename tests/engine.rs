//! End-to-end tests for the scenario engine
//!
//! These run real scenarios against the `mock_target` binary built with
//! this crate, covering extraction across steps, stop-on-error, timeouts,
//! and exit/stderr handling.

use std::path::PathBuf;
use std::time::Duration;

use harness::engine::{EventBus, ProcessAdapter, RunEvent};
use harness::{Error, Scenario, ScenarioRunner};
use tokio_util::sync::CancellationToken;

fn mock_target() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mock_target"))
}

fn runner() -> ScenarioRunner {
    ScenarioRunner::new(ProcessAdapter::new(mock_target()).with_timeout(Duration::from_secs(10)))
}

const LOGIN_QUERY: &str = r#"
name: Login then query
variables:
  USER: alice
steps:
  - name: Login as {{USER}}
    command: login
    args:
      Command: login
      User: "{{USER}}"
    extract:
      - name: result
        pattern: Result
        variable: RESULT_CODE
      - name: session
        pattern: SessionId
        variable: SESSION_ID
    test:
      - RESULT_CODE == 0
      - "js: SESSION_ID.startsWith('sess-alice-')"
  - name: Query
    command: query
    args:
      Command: query
      Session: "{{SESSION_ID}}"
    extract:
      - name: echoed
        pattern: Session=(\S+)
        variable: QUERY_SESSION
    test:
      - "js: QUERY_SESSION.startsWith('sess-alice-')"
"#;

#[tokio::test]
async fn test_session_flows_between_steps() {
    let scenario = Scenario::from_yaml_str(LOGIN_QUERY).unwrap();
    let result = runner().run(&scenario, &CancellationToken::new()).await;

    assert!(result.success, "{:#?}", result.steps);
    assert_eq!(result.summary.total, 2);
    assert_eq!(result.summary.passed, 2);

    let session = result.steps[0].extracted.get("SESSION_ID").cloned().unwrap();
    assert!(session.starts_with("sess-alice-"));
    assert_eq!(
        result.steps[1].command_line,
        format!("Command=query;Session={}", session)
    );
    assert_eq!(result.steps[1].extracted.get("QUERY_SESSION"), Some(&session));
}

#[tokio::test]
async fn test_stop_on_error_skips_remaining_steps() {
    let scenario = Scenario::from_yaml_str(
        r#"
name: Failing first step
steps:
  - name: Fail
    args:
      Command: fail
    extract:
      - name: result
        pattern: Result
        variable: RESULT_CODE
    test:
      - RESULT_CODE == 0
  - name: Never runs
    args:
      Command: query
"#,
    )
    .unwrap();

    let result = runner().run(&scenario, &CancellationToken::new()).await;

    assert!(!result.success);
    assert_eq!(result.summary.total, 1);
    assert_eq!(result.summary.failed, 1);

    let failed: Vec<_> = result.steps[0].failed_assertions().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].actual, "99");
}

#[tokio::test]
async fn test_continue_after_failure_when_disabled() {
    let scenario = Scenario::from_yaml_str(
        r#"
name: Keep going
stopOnError: false
steps:
  - args:
      Command: fail
    extract:
      - name: result
        pattern: Result
        variable: RESULT_CODE
    test:
      - RESULT_CODE == 0
  - args:
      Command: query
"#,
    )
    .unwrap();

    let result = runner().run(&scenario, &CancellationToken::new()).await;

    assert!(!result.success);
    assert_eq!(result.summary.total, 2);
    assert_eq!(result.summary.passed, 1);
    assert_eq!(result.steps[1].name, "Step 2");
}

#[tokio::test]
async fn test_step_timeout_fails_step() {
    let scenario = Scenario::from_yaml_str(
        r#"
name: Slow target
steps:
  - name: Sleepy
    args:
      sleep_ms: 5000
"#,
    )
    .unwrap();

    let mut runner = ScenarioRunner::new(
        ProcessAdapter::new(mock_target()).with_timeout(Duration::from_millis(200)),
    );
    let result = runner.run(&scenario, &CancellationToken::new()).await;

    assert!(!result.success);
    assert!(result.steps[0].response.is_none());
    assert_eq!(
        result.steps[0].error.as_deref(),
        Some(Error::ProcessTimeout(200).to_string().as_str())
    );
}

#[tokio::test]
async fn test_exit_code_and_stderr_are_captured() {
    let adapter = ProcessAdapter::new(mock_target());
    let response = adapter
        .execute(
            "Command=query;exit=3;stderr=boom",
            |_, _| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.exit_code, 3);
    assert!(!response.success());
    assert!(response.stderr.contains("boom"));
    assert_eq!(response.field("result"), Some("0"));
    assert_eq!(response.field("command"), Some("query"));
}

#[tokio::test]
async fn test_events_follow_run_order() {
    let scenario = Scenario::from_yaml_str(LOGIN_QUERY).unwrap();
    let bus = EventBus::default();
    let mut events = bus.subscribe();

    let mut runner = runner().with_events(bus);
    let result = runner.run(&scenario, &CancellationToken::new()).await;
    assert!(result.success);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            RunEvent::ScenarioStart { steps, .. } => {
                assert_eq!(steps, 2);
                kinds.push("start");
            }
            RunEvent::StepStart { .. } => kinds.push("step"),
            RunEvent::StepComplete { .. } => kinds.push("complete"),
            RunEvent::ScenarioEnd { success, .. } => {
                assert!(success);
                kinds.push("end");
            }
            _ => {}
        }
    }
    assert_eq!(
        kinds,
        vec!["start", "step", "complete", "step", "complete", "end"]
    );
}
