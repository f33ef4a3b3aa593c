//! Scenario data model
//!
//! A scenario is an ordered list of steps, each one invocation of the
//! target executable plus the rules that turn its output into variables
//! and pass/fail checks. Scenarios are immutable once loaded.

mod loader;

use serde::{Deserialize, Serialize};

/// Descriptive metadata carried into results and reports
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScenarioInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A persisted scenario variable, seeded before the first step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variable {
    pub key: String,
    pub value: String,
}

/// A complete scenario
#[derive(Debug, Clone, Serialize)]
pub struct Scenario {
    pub info: ScenarioInfo,
    pub variables: Vec<Variable>,
    pub steps: Vec<Step>,
    /// Halt on the first failing step (default true)
    pub stop_on_error: bool,
}

/// One invocation of the target executable
#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub name: String,
    pub description: Option<String>,
    /// Informational command label; the invocation itself is `arguments`
    pub command: String,
    /// Ordered `key=value` pairs; serialization order follows declaration order
    pub arguments: Vec<(String, String)>,
    pub extractors: Vec<Extractor>,
    pub assertions: Vec<AssertionSpec>,
}

/// Rule mapping executable output to a named variable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Extractor {
    pub name: String,
    /// Bare keyword (parsed field lookup) or regular expression over stdout
    pub pattern: String,
    /// Destination variable
    #[serde(alias = "destination")]
    pub variable: String,
}

impl Extractor {
    /// Keyword patterns are plain word characters; anything else is a regex
    pub fn is_keyword(&self) -> bool {
        !self.pattern.is_empty()
            && self
                .pattern
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

/// A single assertion as written in the scenario
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssertionSpec {
    /// Display name; may contain `{{tokens}}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Assertion source: `VAR exists`, `VAR op VALUE` or `js:EXPR`
    pub assertion: String,
}

impl AssertionSpec {
    pub fn new(assertion: impl Into<String>) -> Self {
        Self {
            name: None,
            description: None,
            assertion: assertion.into(),
        }
    }
}

impl Step {
    /// Build a step with no extraction or assertion rules
    pub fn new(name: impl Into<String>, arguments: Vec<(String, String)>) -> Self {
        Self {
            name: name.into(),
            description: None,
            command: String::new(),
            arguments,
            extractors: Vec::new(),
            assertions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(pattern: &str) -> Extractor {
        Extractor {
            name: "x".to_string(),
            pattern: pattern.to_string(),
            variable: "X".to_string(),
        }
    }

    #[test]
    fn test_keyword_detection() {
        assert!(extractor("Result").is_keyword());
        assert!(extractor("server_info").is_keyword());
        assert!(!extractor("Result=(\\d+)").is_keyword());
        assert!(!extractor("[A-Z]+").is_keyword());
        assert!(!extractor("").is_keyword());
    }
}
