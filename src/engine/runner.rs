//! Scenario runner
//!
//! Drives one scenario through its steps. Each step is substituted,
//! executed, extracted from and asserted on, strictly in order. Progress is
//! published on the runner's [`EventBus`]; the return value is the only
//! other output.

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::common::Error;
use crate::scenario::{Scenario, Step};

use super::assert::{self, AssertionResult};
use super::events::{EventBus, RunEvent};
use super::extract;
use super::process::{serialize_arguments, ProcessAdapter};
use super::result::{ScenarioResult, ScenarioSummary, StepResult};
use super::variables::{VariableStore, Vars};

/// Runner lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Nothing started yet
    Idle,
    /// Seeding variables
    Loading,
    /// Executing the step at this index
    Running(usize),
    /// Finished; `true` when every executed step passed
    Completed(bool),
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loading => write!(f, "loading"),
            Self::Running(i) => write!(f, "running step {}", i + 1),
            Self::Completed(true) => write!(f, "completed"),
            Self::Completed(false) => write!(f, "failed"),
        }
    }
}

/// Executes scenarios against one target executable
pub struct ScenarioRunner {
    adapter: ProcessAdapter,
    events: EventBus<RunEvent>,
    state: RunnerState,
}

impl ScenarioRunner {
    pub fn new(adapter: ProcessAdapter) -> Self {
        Self {
            adapter,
            events: EventBus::default(),
            state: RunnerState::Idle,
        }
    }

    /// Publish on an existing bus instead of a private one
    pub fn with_events(mut self, events: EventBus<RunEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus<RunEvent> {
        &self.events
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn adapter(&self) -> &ProcessAdapter {
        &self.adapter
    }

    /// Run every step of `scenario`
    ///
    /// Never fails: process errors become failed steps. With
    /// `stop_on_error` the first failing step ends the run. Cancellation
    /// kills the running child and ends the run as failed.
    pub async fn run(&mut self, scenario: &Scenario, cancel: &CancellationToken) -> ScenarioResult {
        let started_at = Utc::now();
        self.state = RunnerState::Loading;

        let mut store = VariableStore::from_scenario(scenario);
        tracing::info!(
            scenario = %scenario.info.name,
            steps = scenario.steps.len(),
            variables = store.len(),
            "Scenario started"
        );
        self.events.publish(RunEvent::ScenarioStart {
            info: scenario.info.clone(),
            steps: scenario.steps.len(),
            timestamp: started_at,
        });

        let mut steps = Vec::with_capacity(scenario.steps.len());

        for (index, step) in scenario.steps.iter().enumerate() {
            self.state = RunnerState::Running(index);

            let result = self.run_step(index, step, &mut store, cancel).await;
            let halted = !result.passed && scenario.stop_on_error;
            let cancelled = cancel.is_cancelled();
            steps.push(result);

            if halted || cancelled {
                tracing::info!(
                    scenario = %scenario.info.name,
                    step = index + 1,
                    cancelled,
                    "Scenario halted"
                );
                break;
            }
        }

        let mut result = ScenarioResult {
            info: scenario.info.clone(),
            steps,
            summary: ScenarioSummary::default(),
            success: false,
            started_at,
            finished_at: Utc::now(),
        };
        result.recompute();
        result.summary.duration_ms = result.steps.iter().map(StepResult::duration_ms).sum();

        self.state = RunnerState::Completed(result.success);
        tracing::info!(
            scenario = %scenario.info.name,
            total = result.summary.total,
            passed = result.summary.passed,
            failed = result.summary.failed,
            duration_ms = result.summary.duration_ms,
            "Scenario {}",
            self.state
        );
        self.events.publish(RunEvent::ScenarioEnd {
            info: result.info.clone(),
            summary: result.summary.clone(),
            success: result.success,
        });

        result
    }

    async fn run_step(
        &self,
        index: usize,
        step: &Step,
        store: &mut VariableStore,
        cancel: &CancellationToken,
    ) -> StepResult {
        let name = store.substitute(&step.name, None);
        let arguments = store.substitute_arguments(&step.arguments, None);
        let command_line = serialize_arguments(&arguments);

        tracing::info!(step = index + 1, name = %name, command = %step.command, "Step started");
        tracing::debug!(step = index + 1, command_line = %command_line, "Command line");
        self.events.publish(RunEvent::StepStart {
            index,
            name: name.clone(),
            command: step.command.clone(),
            command_line: command_line.clone(),
            timestamp: Utc::now(),
        });

        let outcome = if cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            let bus = self.events.clone();
            let on_output =
                move |stream, text: &str| bus.publish(RunEvent::output(index, stream, text.to_string()));
            self.adapter.execute(&command_line, on_output, cancel).await
        };

        match outcome {
            Ok(response) => {
                let extracted = extract::extract(&response, &step.extractors, store);
                let names: &VariableStore = store;
                let assertions: Vec<AssertionResult> = step
                    .assertions
                    .iter()
                    .map(|spec| {
                        assert::evaluate_spec(spec, &extracted, |n| {
                            names.substitute(n, Some(&extracted))
                        })
                    })
                    .collect();
                let passed = assertions.iter().all(|a| a.passed);

                for failed in assertions.iter().filter(|a| !a.passed) {
                    tracing::warn!(
                        step = index + 1,
                        assertion = %failed.assertion,
                        expected = %failed.expected,
                        actual = %failed.actual,
                        "Assertion failed"
                    );
                }
                tracing::info!(
                    step = index + 1,
                    exit_code = response.exit_code,
                    duration_ms = response.duration_ms,
                    passed,
                    "Step finished"
                );

                let result = StepResult {
                    index,
                    name,
                    command: step.command.clone(),
                    command_line,
                    response: Some(response),
                    extracted,
                    assertions,
                    passed,
                    error: None,
                };
                self.events.publish(RunEvent::StepComplete {
                    result: Box::new(result.clone()),
                });
                result
            }
            Err(e) => {
                tracing::error!(step = index + 1, name = %name, error = %e, "Step failed");
                self.events.publish(RunEvent::StepError {
                    index,
                    name: name.clone(),
                    error: e.to_string(),
                });
                StepResult {
                    index,
                    name,
                    command: step.command.clone(),
                    command_line,
                    response: None,
                    extracted: Vars::new(),
                    assertions: Vec::new(),
                    passed: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::scenario::{AssertionSpec, Extractor, ScenarioInfo, Variable};

    fn pair(k: &str, v: &str) -> (String, String) {
        (k.to_string(), v.to_string())
    }

    fn extractor(pattern: &str, variable: &str) -> Extractor {
        Extractor {
            name: variable.to_lowercase(),
            pattern: pattern.to_string(),
            variable: variable.to_string(),
        }
    }

    /// `/bin/echo` prints its single argument, which is enough to act as a
    /// target that answers with whatever the step sends
    fn login_query(result_code: &str) -> Scenario {
        let mut login = Step::new(
            "Login as {{USER}}",
            vec![pair("Result", result_code), pair("SessionId", "s-42")],
        );
        login.extractors = vec![
            extractor(r"Result=(\d+)", "RESULT_CODE"),
            extractor(r"SessionId=([^;\s]+)", "SESSION_ID"),
        ];
        login.assertions = vec![AssertionSpec::new("RESULT_CODE == 0")];

        let mut query = Step::new("Query", vec![pair("Session", "{{SESSION_ID}}")]);
        query.extractors = vec![extractor("Session", "QUERY_SESSION")];
        query.assertions = vec![
            AssertionSpec::new("QUERY_SESSION == s-42"),
            AssertionSpec::new("js: QUERY_SESSION.startsWith('s-')"),
        ];

        Scenario {
            info: ScenarioInfo {
                name: "login-query".to_string(),
                ..Default::default()
            },
            variables: vec![Variable {
                key: "USER".to_string(),
                value: "alice".to_string(),
            }],
            steps: vec![login, query],
            stop_on_error: true,
        }
    }

    fn runner() -> ScenarioRunner {
        ScenarioRunner::new(ProcessAdapter::new("/bin/echo"))
    }

    #[tokio::test]
    async fn test_extracted_value_flows_into_next_step() {
        let mut runner = runner();
        let result = runner
            .run(&login_query("0"), &CancellationToken::new())
            .await;

        assert!(result.success);
        assert_eq!(result.summary.total, 2);
        assert_eq!(result.steps[0].name, "Login as alice");
        assert_eq!(result.steps[1].command_line, "Session=s-42");
        assert_eq!(
            result.steps[1].extracted.get("QUERY_SESSION").map(String::as_str),
            Some("s-42")
        );
        assert_eq!(runner.state(), RunnerState::Completed(true));
    }

    #[tokio::test]
    async fn test_failed_assertion_halts_scenario() {
        let mut runner = runner();
        let result = runner
            .run(&login_query("1"), &CancellationToken::new())
            .await;

        assert!(!result.success);
        assert_eq!(result.summary.total, 1);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(runner.state(), RunnerState::Completed(false));
    }

    #[tokio::test]
    async fn test_continue_past_failure_without_stop_on_error() {
        let mut scenario = login_query("1");
        scenario.stop_on_error = false;
        let result = runner().run(&scenario, &CancellationToken::new()).await;

        assert_eq!(result.summary.total, 2);
        assert_eq!(result.summary.passed, 1);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_spawn_error_is_a_failed_step() {
        let mut runner = ScenarioRunner::new(ProcessAdapter::new("/no/such/target"));
        let result = runner
            .run(&login_query("0"), &CancellationToken::new())
            .await;

        assert_eq!(result.steps.len(), 1);
        assert!(result.steps[0].error.is_some());
        assert!(result.steps[0].response.is_none());
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = runner().run(&login_query("0"), &cancel).await;

        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].error.as_deref(), Some("Execution cancelled"));
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_event_order() {
        let mut runner = runner();
        let mut rx = runner.events().subscribe();
        runner
            .run(&login_query("0"), &CancellationToken::new())
            .await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }

        assert_eq!(kinds.first(), Some(&"scenario-start"));
        assert_eq!(kinds.last(), Some(&"scenario-end"));
        let steps: Vec<&str> = kinds
            .iter()
            .copied()
            .filter(|k| *k == "step-start" || *k == "step-complete")
            .collect();
        assert_eq!(
            steps,
            vec!["step-start", "step-complete", "step-start", "step-complete"]
        );
        assert!(kinds.contains(&"stdout-chunk"));
    }

    #[tokio::test]
    async fn test_revalidation_is_idempotent() {
        let scenario = login_query("0");
        let mut result = runner().run(&scenario, &CancellationToken::new()).await;
        let before: Vec<bool> = result.steps.iter().map(|s| s.passed).collect();

        assert::revalidate(&mut result, &scenario);
        assert::revalidate(&mut result, &scenario);

        let after: Vec<bool> = result.steps.iter().map(|s| s.passed).collect();
        assert_eq!(before, after);
        assert!(result.success);
        assert_eq!(result.steps[0].assertions[0].name, "RESULT_CODE == 0");
    }
}
