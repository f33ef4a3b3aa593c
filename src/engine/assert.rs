//! Assertion evaluation
//!
//! Assertions are checked against the variables a step extracted. The
//! grammar is tried in order:
//!
//! 1. `VAR exists`
//! 2. `VAR op VALUE` with `op` one of `== != > < >= <=`
//! 3. `js:EXPR`, evaluated by the sandboxed interpreter
//! 4. anything else passes with a warning
//!
//! Evaluation never fails; errors become `passed = false` with the
//! message as diagnostic.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::scenario::{AssertionSpec, Scenario};

use super::expr::{self, parse_float_prefix, ExprError, Program, Scope, Value};
use super::result::ScenarioResult;
use super::variables::Vars;

static EXISTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^([a-z0-9_]+)\s+exists$").expect("valid regex"));

static COMPARE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_]+)\s*(==|!=|>=|<=|>|<)\s*(.+)$").expect("valid regex")
});

/// Short identifiers bound for well-known variables in `js:` assertions
///
/// Later entries win when several sources are present.
const ALIASES: &[(&str, &str)] = &[
    ("result", "RESULT_CODE"),
    ("serverinfo", "SERVER_INFO"),
    ("errmsg", "ERROR_MESSAGE"),
    ("result", "IDELIVER_RESULT"),
    ("serverinfo", "IDELIVER_SERVER_INFO"),
    ("errmsg", "IDELIVER_ERROR_MSG"),
];

const JS_PREFIX: &str = "js:";

/// Comparison operators of the `VAR op VALUE` form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Lt,
    GtEq,
    LtEq,
}

impl CompareOp {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "==" => CompareOp::Eq,
            "!=" => CompareOp::NotEq,
            ">" => CompareOp::Gt,
            "<" => CompareOp::Lt,
            ">=" => CompareOp::GtEq,
            "<=" => CompareOp::LtEq,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::NotEq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::GtEq => ">=",
            CompareOp::LtEq => "<=",
        }
    }
}

/// A parsed assertion
#[derive(Debug, Clone, PartialEq)]
pub enum Assertion {
    Exists {
        variable: String,
    },
    Compare {
        variable: String,
        op: CompareOp,
        expected: String,
    },
    Expression(String),
    Unknown(String),
}

impl Assertion {
    pub fn parse(source: &str) -> Self {
        let source = source.trim();

        if let Some(caps) = EXISTS_RE.captures(source) {
            return Assertion::Exists {
                variable: caps[1].to_string(),
            };
        }

        if let Some(caps) = COMPARE_RE.captures(source) {
            if let Some(op) = CompareOp::parse(&caps[2]) {
                return Assertion::Compare {
                    variable: caps[1].to_string(),
                    op,
                    expected: strip_quotes(caps[3].trim()).to_string(),
                };
            }
        }

        if let Some(expression) = source.strip_prefix(JS_PREFIX) {
            return Assertion::Expression(expression.trim().to_string());
        }

        Assertion::Unknown(source.to_string())
    }
}

fn strip_quotes(value: &str) -> &str {
    let quoted = value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')));
    if quoted {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Truth value of one operand of a top-level `&&`/`||` chain
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperandResult {
    pub expression: String,
    /// Truthiness of the operand; `None` when it raised an error
    pub result: Option<bool>,
    /// Operand value as `value (type)`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-operand evaluation of a compound expression
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Breakdown {
    pub operator: String,
    pub operands: Vec<OperandResult>,
    pub overall: bool,
}

/// Outcome of one assertion
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
    pub assertion: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub passed: bool,
    pub expected: String,
    pub actual: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Identifiers used by a `js:` expression and their values, if bound
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub referenced: BTreeMap<String, Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<Breakdown>,
}

impl AssertionResult {
    fn new(assertion: &str, passed: bool, expected: String, actual: String) -> Self {
        Self {
            assertion: assertion.to_string(),
            name: assertion.to_string(),
            description: None,
            passed,
            expected,
            actual,
            diagnostic: None,
            warning: None,
            referenced: BTreeMap::new(),
            breakdown: None,
        }
    }

    /// Set the display name and description
    pub fn named(mut self, name: impl Into<String>, description: Option<String>) -> Self {
        self.name = name.into();
        self.description = description;
        self
    }
}

/// Evaluate one assertion against a variable map
pub fn evaluate(source: &str, variables: &Vars) -> AssertionResult {
    match Assertion::parse(source) {
        Assertion::Exists { variable } => {
            let exists = variables.contains_key(&variable);
            AssertionResult::new(
                source,
                exists,
                "exists".to_string(),
                if exists { "exists" } else { "undefined" }.to_string(),
            )
        }
        Assertion::Compare {
            variable,
            op,
            expected,
        } => compare(source, variables.get(&variable), op, expected),
        Assertion::Expression(expression) => evaluate_expression(source, &expression, variables),
        Assertion::Unknown(_) => {
            tracing::warn!(assertion = source, "Unrecognized assertion pattern, skipped");
            let mut result = AssertionResult::new(
                source,
                true,
                "unknown pattern".to_string(),
                "skipped".to_string(),
            );
            result.warning = Some(format!("Unrecognized assertion pattern: {}", source));
            result
        }
    }
}

/// Evaluate a scenario assertion, resolving its display name
pub fn evaluate_spec(
    spec: &AssertionSpec,
    variables: &Vars,
    resolve_name: impl Fn(&str) -> String,
) -> AssertionResult {
    let name = resolve_name(spec.name.as_deref().unwrap_or(&spec.assertion));
    evaluate(&spec.assertion, variables).named(name, spec.description.clone())
}

/// Loose equality over strings: equal text, or both numeric and equal
fn loosely_equal(actual: &str, expected: &str) -> bool {
    if actual == expected {
        return true;
    }
    let (a, b) = (actual.trim(), expected.trim());
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => !a.is_empty() && !b.is_empty() && x == y,
        _ => false,
    }
}

fn compare(
    source: &str,
    actual: Option<&String>,
    op: CompareOp,
    expected: String,
) -> AssertionResult {
    let passed = match (op, actual) {
        (CompareOp::Eq, Some(a)) => loosely_equal(a, &expected),
        (CompareOp::Eq, None) => false,
        (CompareOp::NotEq, Some(a)) => !loosely_equal(a, &expected),
        (CompareOp::NotEq, None) => true,
        (_, None) => false,
        (_, Some(a)) => {
            let x = parse_float_prefix(a);
            let y = parse_float_prefix(&expected);
            match op {
                CompareOp::Gt => x > y,
                CompareOp::Lt => x < y,
                CompareOp::GtEq => x >= y,
                _ => x <= y,
            }
        }
    };

    let actual_text = actual.cloned().unwrap_or_else(|| "undefined".to_string());
    let mut result = AssertionResult::new(source, passed, expected, actual_text);
    if !passed {
        result.diagnostic = Some(format!(
            "expected {} {} {}, got {}",
            source.split(op.as_str()).next().unwrap_or(source).trim(),
            op.as_str(),
            result.expected,
            result.actual
        ));
    }
    result
}

/// Bind variables, their lowercase spellings and the fixed aliases
fn assertion_scope(variables: &Vars) -> Scope {
    let mut scope = Scope::new();
    for (name, value) in variables {
        scope.bind(name.clone(), value.clone());
    }
    for (name, value) in variables {
        let lower = name.to_lowercase();
        if !variables.contains_key(&lower) {
            scope.bind(lower, value.clone());
        }
    }
    for (alias, source) in ALIASES {
        if let Some(value) = variables.get(*source) {
            scope.bind(*alias, value.clone());
        }
    }
    scope
}

fn describe(value: &Value) -> String {
    format!("{} ({})", value, value.type_name())
}

fn evaluate_expression(source: &str, expression: &str, variables: &Vars) -> AssertionResult {
    let program = match Program::parse(expression) {
        Ok(program) => program,
        Err(e) => return expression_error(source, e),
    };
    let scope = assertion_scope(variables);

    let referenced = program
        .identifiers()
        .into_iter()
        .filter(|name| !expr::is_builtin(name))
        .map(|name| {
            let value = scope.binding(&name).map(Value::to_string);
            (name, value)
        })
        .collect();

    let outcome = program.evaluate(&scope);

    let breakdown = program.logical_operands().map(|(op, operands)| Breakdown {
        operator: op.as_str().to_string(),
        operands: operands
            .into_iter()
            .map(|node| {
                let expression = program.text(node).to_string();
                match program.evaluate_node(node, &scope) {
                    Ok(value) => OperandResult {
                        expression,
                        result: Some(value.truthy()),
                        value: Some(describe(&value)),
                        error: None,
                    },
                    Err(e) => OperandResult {
                        expression,
                        result: None,
                        value: None,
                        error: Some(e.to_string()),
                    },
                }
            })
            .collect(),
        overall: outcome.as_ref().map(Value::truthy).unwrap_or(false),
    });

    let mut result = match outcome {
        Ok(value) => {
            let passed = value.truthy();
            let mut result =
                AssertionResult::new(source, passed, "truthy".to_string(), describe(&value));
            if !passed {
                result.diagnostic = Some(format!("{} evaluated to {}", expression, result.actual));
            }
            result
        }
        Err(e) => expression_error(source, e),
    };
    result.referenced = referenced;
    result.breakdown = breakdown;
    result
}

fn expression_error(source: &str, error: ExprError) -> AssertionResult {
    let mut result = AssertionResult::new(
        source,
        false,
        "truthy".to_string(),
        describe(&Value::Bool(false)),
    );
    result.diagnostic = Some(error.to_string());
    result
}

/// Re-evaluate every executed step's assertions from its stored extraction
///
/// Replaces `assertions` and `passed` on each step and recomputes the
/// summary. Display names already resolved during the run are kept.
/// Running it twice gives the same result as running it once.
pub fn revalidate(result: &mut ScenarioResult, scenario: &Scenario) {
    for step in &mut result.steps {
        let Some(spec) = scenario.steps.get(step.index) else {
            continue;
        };

        let assertions: Vec<AssertionResult> = spec
            .assertions
            .iter()
            .enumerate()
            .map(|(i, assertion)| {
                let name = step
                    .assertions
                    .get(i)
                    .map(|previous| previous.name.clone())
                    .unwrap_or_else(|| {
                        assertion
                            .name
                            .clone()
                            .unwrap_or_else(|| assertion.assertion.clone())
                    });
                evaluate(&assertion.assertion, &step.extracted)
                    .named(name, assertion.description.clone())
            })
            .collect();

        step.passed = step.error.is_none() && assertions.iter().all(|a| a.passed);
        step.assertions = assertions;
    }
    result.recompute();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            Assertion::parse("SESSION_ID EXISTS"),
            Assertion::Exists {
                variable: "SESSION_ID".into()
            }
        );
        assert_eq!(
            Assertion::parse("RESULT_CODE == '0'"),
            Assertion::Compare {
                variable: "RESULT_CODE".into(),
                op: CompareOp::Eq,
                expected: "0".into()
            }
        );
        assert_eq!(
            Assertion::parse("js: result == 0"),
            Assertion::Expression("result == 0".into())
        );
        assert_eq!(
            Assertion::parse("response looks fine"),
            Assertion::Unknown("response looks fine".into())
        );
    }

    #[test]
    fn test_exists() {
        let v = vars(&[("SESSION_ID", "abc")]);
        assert!(evaluate("SESSION_ID exists", &v).passed);
        let missing = evaluate("TOKEN exists", &v);
        assert!(!missing.passed);
        assert_eq!(missing.actual, "undefined");
    }

    #[test]
    fn test_equality_on_missing_variable() {
        let result = evaluate("RESULT_CODE == 0", &Vars::new());
        assert!(!result.passed);
        assert_eq!(result.actual, "undefined");
        assert_eq!(result.expected, "0");
        assert!(result.diagnostic.is_some());

        assert!(evaluate("RESULT_CODE != 0", &Vars::new()).passed);
    }

    #[test]
    fn test_loose_equality() {
        let v = vars(&[("RESULT_CODE", "0"), ("AMOUNT", "1000.0"), ("MSG", "OK")]);
        assert!(evaluate("RESULT_CODE == 0", &v).passed);
        assert!(evaluate("AMOUNT == 1000", &v).passed);
        assert!(evaluate("MSG == \"OK\"", &v).passed);
        assert!(!evaluate("MSG == ok", &v).passed);
        assert!(evaluate("RESULT_CODE != 1", &v).passed);
    }

    #[test]
    fn test_numeric_comparison() {
        let v = vars(&[("COUNT", "12"), ("LATENCY", "35ms")]);
        assert!(evaluate("COUNT > 9", &v).passed);
        assert!(evaluate("COUNT >= 12", &v).passed);
        assert!(!evaluate("COUNT < 12", &v).passed);
        assert!(evaluate("LATENCY < 100", &v).passed);
        assert!(!evaluate("MISSING > 0", &v).passed);
    }

    #[test]
    fn test_js_expression_with_aliases() {
        let v = vars(&[
            ("RESULT_CODE", "0"),
            ("SERVER_INFO", "srv-1"),
            ("SESSION_ID", "abc"),
        ]);
        let result = evaluate("js: result == '0' && serverinfo.startsWith('srv')", &v);
        assert!(result.passed);
        assert_eq!(result.expected, "truthy");
        assert_eq!(result.actual, "true (boolean)");

        assert!(evaluate("js: session_id.length == 3", &v).passed);
    }

    #[test]
    fn test_js_breakdown_on_failure() {
        let v = vars(&[("RESULT_CODE", "0"), ("SESSION_ID", "")]);
        let result = evaluate(
            "js: RESULT_CODE == 0 && SESSION_ID.length > 0 && TOKEN == 1",
            &v,
        );
        assert!(!result.passed);

        let breakdown = result.breakdown.unwrap();
        assert_eq!(breakdown.operator, "&&");
        assert!(!breakdown.overall);
        assert_eq!(breakdown.operands.len(), 3);
        assert_eq!(breakdown.operands[0].result, Some(true));
        assert_eq!(breakdown.operands[1].expression, "SESSION_ID.length > 0");
        assert_eq!(breakdown.operands[1].result, Some(false));
        assert_eq!(breakdown.operands[2].result, None);
        assert!(breakdown.operands[2]
            .error
            .as_deref()
            .unwrap()
            .contains("TOKEN is not defined"));

        assert_eq!(result.referenced.get("RESULT_CODE"), Some(&Some("0".to_string())));
        assert_eq!(result.referenced.get("TOKEN"), Some(&None));
    }

    #[test]
    fn test_js_error_fails_with_diagnostic() {
        let result = evaluate("js: TOKEN.length > 0", &Vars::new());
        assert!(!result.passed);
        assert_eq!(
            result.diagnostic.as_deref(),
            Some("ReferenceError: TOKEN is not defined")
        );

        let syntax = evaluate("js: (1 +", &Vars::new());
        assert!(!syntax.passed);
        assert!(syntax.diagnostic.unwrap().starts_with("SyntaxError"));
    }

    #[test]
    fn test_unknown_pattern_passes_with_warning() {
        let result = evaluate("response should look fine", &Vars::new());
        assert!(result.passed);
        assert_eq!(result.expected, "unknown pattern");
        assert_eq!(result.actual, "skipped");
        assert!(result.warning.is_some());
    }

    #[test]
    fn test_evaluate_spec_resolves_name() {
        let spec = AssertionSpec {
            name: Some("session for {{USER}}".into()),
            description: Some("desc".into()),
            assertion: "SESSION_ID exists".into(),
        };
        let result = evaluate_spec(&spec, &vars(&[("SESSION_ID", "x")]), |n| {
            n.replace("{{USER}}", "alice")
        });
        assert_eq!(result.name, "session for alice");
        assert_eq!(result.description.as_deref(), Some("desc"));
        assert!(result.passed);
    }
}
