//! Extraction of policy violations from `opa eval -f json` output.
//!
//! The expected shape is
//! `{"result": [{"expressions": [{"value": {<package>: {"deny": [..]}}}]}]}`.
//! Anything that does not match contributes nothing; the parser never fails.

use serde_json::{Map, Value};
use tracing::debug;

use crate::core::types::{Severity, Violation};

const DENY_RULE: &str = "deny";
const VIOLATION_RULE: &str = "violation";
const MAX_DEPTH: usize = 16;

/// Parse raw evaluator text. Non-JSON input yields an empty list.
pub fn parse_policy_output_str(raw: &str) -> Vec<Violation> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => parse_policy_output(&value),
        Err(err) => {
            debug!(error = %err, "policy output is not JSON");
            Vec::new()
        }
    }
}

/// Walk result entries, then expressions, then values, collecting every
/// message under a `deny` or `violation` rule.
pub fn parse_policy_output(output: &Value) -> Vec<Violation> {
    let mut violations = Vec::new();
    let Some(results) = output.get("result").and_then(Value::as_array) else {
        debug!("policy output has no result array");
        return violations;
    };

    for entry in results {
        let Some(expressions) = entry.get("expressions").and_then(Value::as_array) else {
            continue;
        };
        for expression in expressions {
            match expression.get("value") {
                Some(Value::Object(packages)) => {
                    collect_packages(packages, None, 0, &mut violations);
                }
                Some(other) => debug!(kind = json_kind(other), "skipping non-object value"),
                None => {}
            }
        }
    }
    violations
}

fn collect_packages(
    packages: &Map<String, Value>,
    prefix: Option<&str>,
    depth: usize,
    out: &mut Vec<Violation>,
) {
    if depth >= MAX_DEPTH {
        debug!(depth, "policy output nesting too deep");
        return;
    }
    for (name, value) in packages {
        let Value::Object(package) = value else {
            continue;
        };
        let package_name = match prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.clone(),
        };

        let rule = package
            .get(DENY_RULE)
            .or_else(|| package.get(VIOLATION_RULE));
        match rule {
            Some(Value::Array(entries)) => {
                out.extend(entries.iter().map(|entry| violation_from(&package_name, entry)));
            }
            Some(other) => {
                debug!(package = %package_name, kind = json_kind(other), "rule is not a list");
            }
            None => collect_packages(package, Some(&package_name), depth + 1, out),
        }
    }
}

fn violation_from(package: &str, entry: &Value) -> Violation {
    match entry {
        Value::String(message) => Violation::new(package, message.clone()),
        Value::Object(fields) => {
            let message = fields
                .get("msg")
                .or_else(|| fields.get("message"))
                .map_or_else(|| entry.to_string(), render);
            let mut violation = Violation::new(package, message);
            violation.resource = fields.get("resource").map(render);
            violation.severity = fields
                .get("severity")
                .and_then(Value::as_str)
                .and_then(Severity::parse)
                .unwrap_or_default();
            violation
        }
        other => Violation::new(package, other.to_string()),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
