//! Environment variable interpolation for configuration documents
//!
//! Every string field in a server catalog passes through interpolation
//! before being stored, so tokens and URLs can reference the process
//! environment instead of being written into the file.
//!
//! # Syntax
//!
//! - `${NAME}` -- substitutes the value of `NAME`; an error if unset.
//! - `${NAME|default}` -- substitutes `default` when `NAME` is unset.
//! - `${NAME|null}` -- substitutes the empty string when `NAME` is unset.

use regex::Regex;
use serde_json::Value;

use crate::error::{BrokerError, Result};

/// Pattern matching `${VAR}` or `${VAR|default}`.
const VAR_PATTERN: &str = r"\$\{([^}|]+)(?:\|([^}]*))?\}";

/// Interpolates environment variables in a single string.
///
/// Multiple placeholders in one string are all expanded. Text outside
/// placeholders is passed through unchanged.
///
/// # Errors
///
/// Returns [`BrokerError::Interpolation`] naming the variable when a
/// `${NAME}` placeholder has no default and `NAME` is not set in the
/// process environment.
///
/// # Examples
///
/// ```
/// use capbroker::config::interpolate::interpolate_str;
///
/// std::env::set_var("CAPBROKER_DOC_EXAMPLE", "hello");
/// let out = interpolate_str("value=${CAPBROKER_DOC_EXAMPLE}").unwrap();
/// assert_eq!(out, "value=hello");
///
/// let out = interpolate_str("${CAPBROKER_DOC_MISSING|fallback}").unwrap();
/// assert_eq!(out, "fallback");
/// ```
pub fn interpolate_str(input: &str) -> Result<String> {
    // The pattern is a compile-time constant; construction cannot fail.
    let re = Regex::new(VAR_PATTERN).expect("interpolation pattern is valid");

    let mut output = String::with_capacity(input.len());
    let mut last_end = 0;

    for caps in re.captures_iter(input) {
        let whole = caps.get(0).expect("capture 0 always present");
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str());

        output.push_str(&input[last_end..whole.start()]);

        match std::env::var(var_name) {
            Ok(value) => output.push_str(&value),
            Err(_) => match default {
                // `null` is the documented spelling for "empty string".
                Some("null") => {}
                Some(default) => output.push_str(default),
                None => {
                    return Err(BrokerError::Interpolation {
                        variable: var_name.to_string(),
                    }
                    .into());
                }
            },
        }

        last_end = whole.end();
    }

    output.push_str(&input[last_end..]);
    Ok(output)
}

/// Recursively interpolates environment variables in a JSON document.
///
/// Strings are expanded via [`interpolate_str`]; objects and arrays are
/// walked recursively; numbers, booleans, and nulls are returned
/// unchanged.
///
/// # Errors
///
/// Returns [`BrokerError::Interpolation`] from the first string whose
/// expansion fails; the rest of the document is not processed.
pub fn interpolate_value(value: Value) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(interpolate_str(&s)?)),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k, interpolate_value(v)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(interpolate_value(item)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Each test uses a uniquely named variable so tests can run in
    // parallel without interfering with each other.

    #[test]
    fn test_interpolate_str_set_variable() {
        std::env::set_var("CAPBROKER_TEST_SET", "value");
        let result = interpolate_str("${CAPBROKER_TEST_SET}").unwrap();
        assert_eq!(result, "value");
    }

    #[test]
    fn test_interpolate_str_missing_variable_errors() {
        let result = interpolate_str("${CAPBROKER_TEST_DEFINITELY_UNSET}");
        assert!(result.is_err());
        let msg = result.unwrap_err().to_string();
        assert!(
            msg.contains("CAPBROKER_TEST_DEFINITELY_UNSET"),
            "error must name the missing variable: {msg}"
        );
    }

    #[test]
    fn test_interpolate_str_missing_with_default() {
        let result = interpolate_str("${CAPBROKER_TEST_UNSET_A|fallback}").unwrap();
        assert_eq!(result, "fallback");
    }

    #[test]
    fn test_interpolate_str_missing_with_null_default() {
        let result = interpolate_str("${CAPBROKER_TEST_UNSET_B|null}").unwrap();
        assert_eq!(result, "");
    }

    #[test]
    fn test_interpolate_str_set_variable_wins_over_default() {
        std::env::set_var("CAPBROKER_TEST_WINS", "real");
        let result = interpolate_str("${CAPBROKER_TEST_WINS|fallback}").unwrap();
        assert_eq!(result, "real");
    }

    #[test]
    fn test_interpolate_str_empty_default() {
        let result = interpolate_str("${CAPBROKER_TEST_UNSET_C|}").unwrap();
        assert_eq!(result, "");
    }

    #[test]
    fn test_interpolate_str_surrounding_text_preserved() {
        std::env::set_var("CAPBROKER_TEST_MID", "core");
        let result = interpolate_str("prefix-${CAPBROKER_TEST_MID}-suffix").unwrap();
        assert_eq!(result, "prefix-core-suffix");
    }

    #[test]
    fn test_interpolate_str_multiple_placeholders() {
        std::env::set_var("CAPBROKER_TEST_ONE", "1");
        std::env::set_var("CAPBROKER_TEST_TWO", "2");
        let result = interpolate_str("${CAPBROKER_TEST_ONE}:${CAPBROKER_TEST_TWO}").unwrap();
        assert_eq!(result, "1:2");
    }

    #[test]
    fn test_interpolate_str_plain_string_unchanged() {
        let result = interpolate_str("no placeholders here").unwrap();
        assert_eq!(result, "no placeholders here");
    }

    #[test]
    fn test_interpolate_value_walks_nested_document() {
        std::env::set_var("CAPBROKER_TEST_NESTED", "tok");
        let doc = json!({
            "auth": { "token": "${CAPBROKER_TEST_NESTED}" },
            "args": ["${CAPBROKER_TEST_NESTED}", "literal"],
            "timeout": 30,
            "enabled": true
        });

        let result = interpolate_value(doc).unwrap();
        assert_eq!(result["auth"]["token"], "tok");
        assert_eq!(result["args"][0], "tok");
        assert_eq!(result["args"][1], "literal");
        assert_eq!(result["timeout"], 30);
        assert_eq!(result["enabled"], true);
    }

    #[test]
    fn test_interpolate_value_propagates_missing_variable() {
        let doc = json!({ "url": "${CAPBROKER_TEST_UNSET_D}" });
        let result = interpolate_value(doc);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("CAPBROKER_TEST_UNSET_D"));
    }
}
