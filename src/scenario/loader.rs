//! YAML scenario loading
//!
//! Deserializes the on-disk scenario format and normalizes it into the
//! engine's model: ordered string arguments, stringified scalars, default
//! step names.

use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;

use crate::common::{Error, Result};

use super::{AssertionSpec, Extractor, Scenario, ScenarioInfo, Step, Variable};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RawScenario {
    name: Option<String>,
    description: Option<String>,
    version: Option<serde_yaml::Value>,
    #[serde(default)]
    variables: IndexMap<String, serde_yaml::Value>,
    #[serde(alias = "stop_on_error")]
    stop_on_error: Option<bool>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Deserialize, Debug)]
struct RawStep {
    name: Option<String>,
    description: Option<String>,
    command: Option<String>,
    #[serde(default, alias = "arguments")]
    args: IndexMap<String, serde_yaml::Value>,
    #[serde(default, alias = "extractors")]
    extract: Vec<Extractor>,
    #[serde(default, alias = "tests")]
    test: Vec<RawAssertion>,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum RawAssertion {
    Plain(String),
    Detailed {
        name: Option<String>,
        description: Option<String>,
        assertion: String,
    },
}

impl From<RawAssertion> for AssertionSpec {
    fn from(raw: RawAssertion) -> Self {
        match raw {
            RawAssertion::Plain(assertion) => AssertionSpec::new(assertion),
            RawAssertion::Detailed {
                name,
                description,
                assertion,
            } => AssertionSpec {
                name,
                description,
                assertion,
            },
        }
    }
}

/// Render a YAML scalar the way it reads in the file
fn scalar_to_string(value: serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

impl Scenario {
    /// Load a scenario from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::scenario_load(path, e))?;
        let mut scenario =
            Self::from_yaml_str(&content).map_err(|e| Error::scenario_load(path, e))?;

        if scenario.info.name.is_empty() {
            scenario.info.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "Untitled Scenario".to_string());
        }
        Ok(scenario)
    }

    /// Parse a scenario from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let raw: RawScenario = serde_yaml::from_str(content)?;

        let variables = raw
            .variables
            .into_iter()
            .map(|(key, value)| Variable {
                key,
                value: scalar_to_string(value),
            })
            .collect();

        let steps = raw
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| Step {
                name: step.name.unwrap_or_else(|| format!("Step {}", i + 1)),
                description: step.description,
                command: step.command.unwrap_or_default(),
                arguments: step
                    .args
                    .into_iter()
                    .map(|(k, v)| (k, scalar_to_string(v)))
                    .collect(),
                extractors: step.extract,
                assertions: step.test.into_iter().map(AssertionSpec::from).collect(),
            })
            .collect();

        Ok(Scenario {
            info: ScenarioInfo {
                name: raw.name.unwrap_or_default(),
                description: raw.description,
                version: raw.version.map(scalar_to_string),
            },
            variables,
            steps,
            stop_on_error: raw.stop_on_error.unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_FLOW: &str = r#"
name: Login flow
version: 1.0
variables:
  USER: alice
  RETRIES: 3
steps:
  - name: Login
    command: login
    args:
      Command: login
      User: "{{USER}}"
      Amount: 1000
    extract:
      - name: session
        pattern: SessionId
        variable: SESSION_ID
    test:
      - RESULT_CODE == 0
      - name: "session for {{USER}}"
        assertion: "js: SESSION_ID.length > 0"
  - command: query
    args:
      Session: "{{SESSION_ID}}"
"#;

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::from_yaml_str(LOGIN_FLOW).unwrap();
        assert_eq!(scenario.info.name, "Login flow");
        assert_eq!(scenario.info.version.as_deref(), Some("1.0"));
        assert!(scenario.stop_on_error);
        assert_eq!(scenario.variables.len(), 2);
        assert_eq!(scenario.variables[1].value, "3");
        assert_eq!(scenario.steps.len(), 2);
        assert_eq!(scenario.steps[1].name, "Step 2");
    }

    #[test]
    fn test_arguments_keep_declaration_order() {
        let scenario = Scenario::from_yaml_str(LOGIN_FLOW).unwrap();
        let keys: Vec<&str> = scenario.steps[0]
            .arguments
            .iter()
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(keys, vec!["Command", "User", "Amount"]);
        assert_eq!(scenario.steps[0].arguments[2].1, "1000");
    }

    #[test]
    fn test_assertion_forms() {
        let scenario = Scenario::from_yaml_str(LOGIN_FLOW).unwrap();
        let assertions = &scenario.steps[0].assertions;
        assert_eq!(assertions[0].assertion, "RESULT_CODE == 0");
        assert!(assertions[0].name.is_none());
        assert_eq!(assertions[1].name.as_deref(), Some("session for {{USER}}"));
    }

    #[test]
    fn test_stop_on_error_override() {
        let scenario =
            Scenario::from_yaml_str("name: x\nstopOnError: false\nsteps: []\n").unwrap();
        assert!(!scenario.stop_on_error);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Scenario::load(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, Error::ScenarioLoad { .. }));
    }
}
