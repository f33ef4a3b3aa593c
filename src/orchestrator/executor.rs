//! Executor seam between the orchestrator and the engine

use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::common::{Error, Result};
use crate::engine::process::serialize_arguments;
use crate::engine::{EventBus, Response, RunEvent, ScenarioResult, ScenarioRunner};
use crate::scenario::Scenario;

use super::job::ResolvedJob;

/// Runs the work behind a resolved job
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// One invocation with the job's own arguments
    async fn run_plain(&self, job: &ResolvedJob, cancel: &CancellationToken) -> Result<Response>;

    /// One scenario file
    async fn run_scenario(
        &self,
        job: &ResolvedJob,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ScenarioResult>;
}

/// Executes jobs with the scenario engine
#[derive(Debug, Clone, Default)]
pub struct EngineExecutor {
    events: EventBus<RunEvent>,
}

impl EngineExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish runner events on a shared bus
    pub fn with_events(events: EventBus<RunEvent>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &EventBus<RunEvent> {
        &self.events
    }
}

#[async_trait]
impl JobExecutor for EngineExecutor {
    async fn run_plain(&self, job: &ResolvedJob, cancel: &CancellationToken) -> Result<Response> {
        let command_line = serialize_arguments(&job.descriptor.argument_pairs());
        let job_name = job.name().to_string();
        job.adapter()
            .execute(
                &command_line,
                |stream, text: &str| {
                    tracing::trace!(job = %job_name, ?stream, "{}", text.trim_end());
                },
                cancel,
            )
            .await
    }

    async fn run_scenario(
        &self,
        job: &ResolvedJob,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ScenarioResult> {
        let scenario = Scenario::load(path)?;
        let mut runner = ScenarioRunner::new(job.adapter()).with_events(self.events.clone());
        Ok(runner.run(&scenario, cancel).await)
    }
}

/// Map a plain run's response to success, for reports
pub fn plain_error(response: &Response) -> Option<Error> {
    (!response.success()).then(|| Error::ProcessExit(response.exit_code))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::common::config::EngineConfig;
    use crate::orchestrator::job::{resolve, JobDescriptor};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn echo_job(arguments: &str) -> ResolvedJob {
        let descriptor = JobDescriptor {
            name: "echo".to_string(),
            binary_path: Some(PathBuf::from("/bin/echo")),
            arguments: serde_json::from_str(arguments).unwrap(),
            ..Default::default()
        };
        resolve(descriptor, Path::new("/"), &EngineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_plain_run_serializes_arguments() {
        let job = echo_job(r#"{"Command": "ping", "Count": 2}"#);
        let response = EngineExecutor::new()
            .run_plain(&job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.stdout.trim_end(), "Command=ping;Count=2");
        assert!(plain_error(&response).is_none());
    }

    #[tokio::test]
    async fn test_scenario_run_loads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("flow.yaml");
        std::fs::write(
            &path,
            "name: Flow\nsteps:\n  - name: One\n    args:\n      Result: 0\n    test:\n      - RESULT_CODE == 0\n    extract:\n      - name: code\n        pattern: \"Result=(\\\\d+)\"\n        variable: RESULT_CODE\n",
        )
        .unwrap();

        let executor = EngineExecutor::new();
        let mut events = executor.events().subscribe();
        let result = executor
            .run_scenario(&echo_job("{}"), &path, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.info.name, "Flow");
        assert!(matches!(events.recv().await.unwrap(), RunEvent::ScenarioStart { .. }));
    }

    #[tokio::test]
    async fn test_scenario_load_failure() {
        let err = EngineExecutor::new()
            .run_scenario(
                &echo_job("{}"),
                Path::new("/definitely/missing.yaml"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScenarioLoad { .. }));
    }

    #[test]
    fn test_non_zero_exit_is_error() {
        let response = Response {
            exit_code: 3,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
            parsed_fields: Default::default(),
            command_line: String::new(),
            started_at: chrono::Utc::now(),
        };
        assert_eq!(
            plain_error(&response).map(|e| e.to_string()),
            Some("Process exited with code 3".to_string())
        );
    }
}
