//! Variable extraction from a step's response
//!
//! Keyword patterns look up the parsed `key=value` fields; anything else is
//! a regular expression over stdout whose first capture group becomes the
//! value. A miss is logged, never an error.

use regex::Regex;

use crate::scenario::Extractor;

use super::result::Response;
use super::variables::{Vars, VariableStore};

/// Why an extractor produced no value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionMiss {
    /// Keyword not present in the parsed fields
    FieldMissing { key: String, available: Vec<String> },
    /// Regex did not match, or matched without a first group
    NoMatch,
    /// Pattern is not a valid regular expression
    InvalidPattern(String),
}

/// Apply one extractor to a response
pub fn extract_one(
    response: &Response,
    extractor: &Extractor,
) -> std::result::Result<String, ExtractionMiss> {
    if extractor.is_keyword() {
        let key = extractor.pattern.to_lowercase();
        return response
            .parsed_fields
            .get(&key)
            .cloned()
            .ok_or_else(|| ExtractionMiss::FieldMissing {
                key,
                available: response.parsed_fields.keys().cloned().collect(),
            });
    }

    let regex = Regex::new(&extractor.pattern)
        .map_err(|e| ExtractionMiss::InvalidPattern(e.to_string()))?;
    regex
        .captures(&response.stdout)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(ExtractionMiss::NoMatch)
}

/// Run every extractor, writing hits into both the returned step-local map
/// and the store
pub fn extract(response: &Response, extractors: &[Extractor], store: &mut VariableStore) -> Vars {
    let mut extracted = Vars::new();

    for extractor in extractors {
        match extract_one(response, extractor) {
            Ok(value) => {
                tracing::debug!(
                    extractor = %extractor.name,
                    variable = %extractor.variable,
                    value = %value,
                    "Extracted"
                );
                store.set(extractor.variable.clone(), value.clone());
                extracted.insert(extractor.variable.clone(), value);
            }
            Err(ExtractionMiss::FieldMissing { key, available }) => {
                tracing::warn!(
                    extractor = %extractor.name,
                    key = %key,
                    available = %available.join(", "),
                    "Field not found in response"
                );
            }
            Err(ExtractionMiss::NoMatch) => {
                tracing::warn!(
                    extractor = %extractor.name,
                    pattern = %extractor.pattern,
                    "Pattern did not match output"
                );
            }
            Err(ExtractionMiss::InvalidPattern(e)) => {
                tracing::warn!(
                    extractor = %extractor.name,
                    pattern = %extractor.pattern,
                    error = %e,
                    "Invalid extraction pattern"
                );
            }
        }
    }

    extracted
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn response(stdout: &str) -> Response {
        Response {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration_ms: 3,
            parsed_fields: Response::parse_fields(stdout),
            command_line: String::new(),
            started_at: Utc::now(),
        }
    }

    fn extractor(pattern: &str, variable: &str) -> Extractor {
        Extractor {
            name: variable.to_lowercase(),
            pattern: pattern.to_string(),
            variable: variable.to_string(),
        }
    }

    #[test]
    fn test_keyword_is_case_insensitive() {
        let resp = response("SessionId=abc123\nResult=0\n");
        assert_eq!(
            extract_one(&resp, &extractor("SESSIONID", "SESSION_ID")),
            Ok("abc123".to_string())
        );
    }

    #[test]
    fn test_keyword_miss_lists_available_keys() {
        let resp = response("Result=0\n");
        match extract_one(&resp, &extractor("SessionId", "SESSION_ID")) {
            Err(ExtractionMiss::FieldMissing { key, available }) => {
                assert_eq!(key, "sessionid");
                assert_eq!(available, vec!["result".to_string()]);
            }
            other => panic!("Expected FieldMissing, got {:?}", other),
        }
    }

    #[test]
    fn test_regex_takes_first_group() {
        let resp = response("banner\nToken: XYZ-9\n");
        assert_eq!(
            extract_one(&resp, &extractor(r"Token: (\S+)", "TOKEN")),
            Ok("XYZ-9".to_string())
        );
        assert_eq!(
            extract_one(&resp, &extractor(r"Token: \S+", "TOKEN")),
            Err(ExtractionMiss::NoMatch)
        );
        assert!(matches!(
            extract_one(&resp, &extractor(r"Token: (", "TOKEN")),
            Err(ExtractionMiss::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_extract_writes_local_and_store() {
        let resp = response("Result=0\nSessionId=s-1\n");
        let mut store = VariableStore::new();
        let extracted = extract(
            &resp,
            &[
                extractor("Result", "RESULT_CODE"),
                extractor("SessionId", "SESSION_ID"),
                extractor("Missing", "NOPE"),
            ],
            &mut store,
        );
        assert_eq!(extracted.len(), 2);
        assert_eq!(extracted.get("SESSION_ID").map(String::as_str), Some("s-1"));
        assert_eq!(store.get("RESULT_CODE"), Some("0"));
        assert!(!store.contains("NOPE"));
    }

    #[test]
    fn test_keyword_value_is_exact() {
        let resp = response("Message= spaced value \n");
        assert_eq!(
            extract_one(&resp, &extractor("Message", "MSG")),
            Ok(" spaced value ".to_string())
        );
    }
}
