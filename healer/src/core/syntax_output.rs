//! Interpretation of `terraform validate` output.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::core::types::ValidationError;

/// Substrings that mark a failure fixable by running `terraform init` once.
pub const RECOVERABLE_MARKERS: &[&str] = &[
    "Missing required provider",
    "provider registry.terraform.io",
    "Module not installed",
    "Inconsistent dependency lock file",
];

/// True when the combined tool output names missing provider or module metadata.
pub fn is_recoverable_failure(combined_output: &str) -> bool {
    RECOVERABLE_MARKERS
        .iter()
        .any(|marker| combined_output.contains(marker))
}

#[derive(Debug, Deserialize)]
struct ValidateReport {
    #[serde(default)]
    diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Deserialize)]
struct Diagnostic {
    severity: String,
    summary: String,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    range: Option<DiagnosticRange>,
}

#[derive(Debug, Deserialize)]
struct DiagnosticRange {
    filename: String,
    start: DiagnosticPos,
}

#[derive(Debug, Deserialize)]
struct DiagnosticPos {
    line: u32,
}

/// Extract structured errors from a failed validate run.
///
/// JSON diagnostics are preferred; plain text is scanned otherwise. A failed run
/// always yields at least one error.
pub fn extract_validation_errors(
    stdout: &str,
    stderr: &str,
    exit_code: Option<i32>,
) -> Vec<ValidationError> {
    let mut errors = match serde_json::from_str::<ValidateReport>(stdout) {
        Ok(report) => errors_from_diagnostics(report.diagnostics),
        Err(_) => Vec::new(),
    };
    if errors.is_empty() {
        errors = errors_from_text(stderr);
    }
    if errors.is_empty() {
        errors = errors_from_text(stdout);
    }
    if errors.is_empty() {
        let fallback = stderr.trim();
        let message = if fallback.is_empty() {
            match exit_code {
                Some(code) => format!("terraform validate exited with status {code}"),
                None => "terraform validate was terminated by a signal".to_string(),
            }
        } else {
            fallback.to_string()
        };
        errors.push(ValidationError::new(message));
    }
    errors
}

fn errors_from_diagnostics(diagnostics: Vec<Diagnostic>) -> Vec<ValidationError> {
    diagnostics
        .into_iter()
        .filter(|d| d.severity == "error")
        .map(|d| {
            let message = match d.detail.as_deref().map(str::trim) {
                Some(detail) if !detail.is_empty() => format!("{}: {detail}", d.summary),
                _ => d.summary,
            };
            let error = ValidationError::new(message);
            match d.range {
                Some(range) => error.at(range.filename, Some(range.start.line)),
                None => error,
            }
        })
        .collect()
}

static ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:│\s*)?Error:\s*(.+?)\s*$").unwrap());
static LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:│\s*)?\s*on (\S+) line (\d+)").unwrap());

fn errors_from_text(text: &str) -> Vec<ValidationError> {
    let mut errors: Vec<ValidationError> = Vec::new();
    for line in text.lines() {
        if let Some(caps) = ERROR_RE.captures(line) {
            errors.push(ValidationError::new(&caps[1]));
            continue;
        }
        if let Some(caps) = LOCATION_RE.captures(line)
            && let Some(last) = errors.last_mut()
            && last.file_path.is_none()
        {
            last.file_path = Some(caps[1].to_string());
            last.line = caps[2].parse().ok();
        }
    }
    errors
}
