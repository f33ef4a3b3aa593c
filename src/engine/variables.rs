//! Variable store and `{{token}}` substitution
//!
//! Tokens resolve in this order, first match wins:
//! 1. builtin dynamic values (`$timestamp`, `$uuid`, ...)
//! 2. `js:` expressions, evaluated by [`super::expr`] in a closed scope
//! 3. step-local values handed in by the caller
//! 4. the store itself
//!
//! Substitution never fails. Unresolved tokens and expression errors are
//! logged and the token is left in place.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{Local, Utc};
use rand::Rng;
use regex::{Captures, Regex};

use crate::scenario::Scenario;

use super::expr::{self, Scope, Value};

/// Name to value map used for extracted and persisted variables
pub type Vars = BTreeMap<String, String>;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^}]+)\}\}").expect("valid regex"));

const JS_PREFIX: &str = "js:";

/// Per-run variable store
///
/// Lives for one scenario run. Seeded from the scenario's variables, then
/// written only by extraction after each step.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    values: Vars,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from a scenario's declared variables
    ///
    /// Each value is substituted once, so later declarations can refer to
    /// earlier ones and builtins are fixed for the whole run.
    pub fn from_scenario(scenario: &Scenario) -> Self {
        let mut store = Self::new();
        for var in &scenario.variables {
            let value = store.substitute(&var.value, None);
            store.set(var.key.clone(), value);
        }
        store
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Borrow the current values
    pub fn values(&self) -> &Vars {
        &self.values
    }

    /// Copy of the current values
    pub fn snapshot(&self) -> Vars {
        self.values.clone()
    }

    /// Replace every `{{token}}` in `text`
    pub fn substitute(&self, text: &str, local: Option<&Vars>) -> String {
        if !text.contains("{{") {
            return text.to_string();
        }

        TOKEN_RE
            .replace_all(text, |caps: &Captures<'_>| {
                let token = caps[1].trim();
                match self.resolve(token, local) {
                    Some(value) => value,
                    None => {
                        tracing::debug!(token, "Unresolved variable left in place");
                        caps[0].to_string()
                    }
                }
            })
            .into_owned()
    }

    /// Substitute every value of an ordered argument list
    pub fn substitute_arguments(
        &self,
        arguments: &[(String, String)],
        local: Option<&Vars>,
    ) -> Vec<(String, String)> {
        arguments
            .iter()
            .map(|(k, v)| (k.clone(), self.substitute(v, local)))
            .collect()
    }

    fn resolve(&self, token: &str, local: Option<&Vars>) -> Option<String> {
        if let Some(value) = builtin(token) {
            return Some(value);
        }

        if let Some(source) = token.strip_prefix(JS_PREFIX) {
            return self.evaluate_embedded(source.trim());
        }

        local
            .and_then(|vars| vars.get(token))
            .or_else(|| self.values.get(token))
            .cloned()
    }

    fn evaluate_embedded(&self, source: &str) -> Option<String> {
        let now = Utc::now();
        let mut scope = Scope::new()
            .with_env()
            .with_variables(self.values.clone());
        scope
            .bind("timestamp", now.timestamp_millis() as f64)
            .bind("randomInt", rand::rng().random_range(0..10_000) as f64)
            .bind("date", now.format("%Y%m%d").to_string())
            .bind("time", Local::now().format("%H%M%S").to_string());

        match expr::evaluate(source, &scope) {
            Ok(Value::Undefined) => {
                tracing::debug!(expression = source, "Embedded expression produced undefined");
                None
            }
            Ok(value) => Some(value.to_string()),
            Err(e) => {
                tracing::warn!(expression = source, error = %e, "Embedded expression failed");
                None
            }
        }
    }
}

/// Dynamic values computed at substitution time
fn builtin(token: &str) -> Option<String> {
    let value = match token {
        "$timestamp" => Utc::now().timestamp_millis().to_string(),
        "$randomInt" => rand::rng().random_range(0..10_000).to_string(),
        "$randomId" => format!(
            "{}{}",
            Utc::now().timestamp_millis(),
            rand::rng().random_range(0..1_000)
        ),
        "$dateTime" => Utc::now().format("%Y%m%d%H%M%S").to_string(),
        "$date" => Utc::now().format("%Y%m%d").to_string(),
        "$time" => Local::now().format("%H%M%S").to_string(),
        "$uuid" => uuid::Uuid::new_v4().to_string(),
        _ => return None,
    };
    Some(value)
}
