//! Shared deterministic types for the remediation core.
//!
//! These types define stable contracts between stages. They carry no I/O and
//! serialize to the same JSON on every run so iteration artifacts stay diffable.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity attached to a policy violation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    #[default]
    High,
    Critical,
}

impl Severity {
    /// Parse a severity label case-insensitively. Unknown labels yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// A single policy-rule failure extracted from policy evaluator output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub package_or_rule: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default)]
    pub severity: Severity,
}

impl Violation {
    pub fn new(package_or_rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            package_or_rule: package_or_rule.into(),
            message: message.into(),
            resource: None,
            severity: Severity::default(),
        }
    }
}

/// A syntax or schema error reported by the syntax check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file_path: None,
            line: None,
        }
    }

    pub fn at(mut self, file_path: impl Into<String>, line: Option<u32>) -> Self {
        self.file_path = Some(file_path.into());
        self.line = line;
        self
    }
}

/// One entry of the aggregator's combined error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemainingError {
    Syntax(ValidationError),
    Policy(Violation),
}

impl fmt::Display for RemainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax(err) => {
                write!(f, "[syntax] {}", err.message)?;
                match (&err.file_path, err.line) {
                    (Some(path), Some(line)) => write!(f, " ({path}:{line})"),
                    (Some(path), None) => write!(f, " ({path})"),
                    _ => Ok(()),
                }
            }
            Self::Policy(violation) => {
                write!(
                    f,
                    "[policy/{}] {}: {}",
                    violation.severity.as_str(),
                    violation.package_or_rule,
                    violation.message
                )?;
                if let Some(resource) = &violation.resource {
                    write!(f, " ({resource})")?;
                }
                Ok(())
            }
        }
    }
}

/// Why an external tool invocation did not produce usable output.
///
/// A timeout is kept distinct from a non-zero exit so logs can tell them apart,
/// but stages treat every kind the same way: as a failed result, never a fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The process could not be started.
    Spawn,
    /// The process exceeded its timeout and was killed.
    TimedOut,
    /// The process exited unsuccessfully (`None` when killed by a signal).
    ExitStatus { code: Option<i32> },
    /// The process succeeded but its output could not be used.
    InvalidOutput,
    /// A local file operation around the tool failed.
    Io,
}

/// Structured record of a failed tool step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub step: String,
    #[serde(flatten)]
    pub kind: FailureKind,
    pub message: String,
    #[serde(default)]
    pub stderr: String,
}

impl ToolFailure {
    pub fn spawn(step: &str, message: impl Into<String>) -> Self {
        Self {
            step: step.to_string(),
            kind: FailureKind::Spawn,
            message: format!("{step} could not be started: {}", message.into()),
            stderr: String::new(),
        }
    }

    pub fn timed_out(step: &str, stderr: impl Into<String>) -> Self {
        Self {
            step: step.to_string(),
            kind: FailureKind::TimedOut,
            message: format!("{step} timed out"),
            stderr: stderr.into(),
        }
    }

    pub fn exit_status(step: &str, code: Option<i32>, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        let status = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        let message = match first_line(&stderr) {
            Some(line) => format!("{step} exited with status {status}: {line}"),
            None => format!("{step} exited with status {status}"),
        };
        Self {
            step: step.to_string(),
            kind: FailureKind::ExitStatus { code },
            message,
            stderr,
        }
    }

    pub fn invalid_output(step: &str, message: impl Into<String>) -> Self {
        Self {
            step: step.to_string(),
            kind: FailureKind::InvalidOutput,
            message: format!("{step} produced unusable output: {}", message.into()),
            stderr: String::new(),
        }
    }

    pub fn io(step: &str, message: impl Into<String>) -> Self {
        Self {
            step: step.to_string(),
            kind: FailureKind::Io,
            message: format!("{step}: {}", message.into()),
            stderr: String::new(),
        }
    }
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}

/// Output of the syntax validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub raw_output: String,
    pub message: String,
    /// True when the init-then-recheck path was taken.
    pub init_attempted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ToolFailure>,
}

impl ValidationResult {
    pub fn passed(raw_output: String, init_attempted: bool) -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            raw_output,
            message: "syntax validation passed".to_string(),
            init_attempted,
            failure: None,
        }
    }

    pub fn failed(errors: Vec<ValidationError>, raw_output: String, init_attempted: bool) -> Self {
        let message = format!("syntax validation failed - {} errors found", errors.len());
        Self {
            valid: false,
            errors,
            raw_output,
            message,
            init_attempted,
            failure: None,
        }
    }

    /// A check that could not complete. Carries the failure as its only error.
    pub fn tool_failure(failure: ToolFailure, init_attempted: bool) -> Self {
        Self {
            valid: false,
            errors: vec![ValidationError::new(failure.message.clone())],
            raw_output: failure.stderr.clone(),
            message: format!("syntax validation could not complete: {}", failure.message),
            init_attempted,
            failure: Some(failure),
        }
    }
}

/// How a policy evaluation pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Passed,
    ViolationsFound,
    /// Not run because the syntax check did not pass.
    Skipped,
    /// A tool step failed before violations could be extracted.
    Failed,
    /// Violations taken from an externally supplied log, not a live evaluation.
    Seeded,
}

/// Package name used for the violation recorded when evaluation itself fails.
pub const EVALUATION_FAILURE_RULE: &str = "policy_evaluation";

/// Output of the policy evaluator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub status: EvaluationStatus,
    pub violations: Vec<Violation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ToolFailure>,
}

impl EvaluationResult {
    pub fn skipped() -> Self {
        Self {
            status: EvaluationStatus::Skipped,
            violations: Vec::new(),
            raw_output: None,
            message: "skipped - syntax validation failed".to_string(),
            failure: None,
        }
    }

    pub fn evaluated(raw_output: Value, violations: Vec<Violation>) -> Self {
        let (status, message) = if violations.is_empty() {
            (
                EvaluationStatus::Passed,
                "policy evaluation passed - no violations found".to_string(),
            )
        } else {
            (
                EvaluationStatus::ViolationsFound,
                format!(
                    "policy evaluation failed - {} violations found",
                    violations.len()
                ),
            )
        };
        Self {
            status,
            violations,
            raw_output: Some(raw_output),
            message,
            failure: None,
        }
    }

    /// Record a failed evaluation.
    ///
    /// The failure is also listed as a critical violation so a broken evaluator
    /// can never be mistaken for a compliant plan.
    pub fn failed(failure: ToolFailure) -> Self {
        let mut violation = Violation::new(EVALUATION_FAILURE_RULE, failure.message.clone());
        violation.severity = Severity::Critical;
        Self {
            status: EvaluationStatus::Failed,
            violations: vec![violation],
            raw_output: None,
            message: format!("policy evaluation failed: {}", failure.message),
            failure: Some(failure),
        }
    }

    pub fn seeded(raw_output: Value, violations: Vec<Violation>) -> Self {
        let message = format!("{} violations seeded from log", violations.len());
        Self {
            status: EvaluationStatus::Seeded,
            violations,
            raw_output: Some(raw_output),
            message,
            failure: None,
        }
    }

    pub fn violation_count(&self) -> usize {
        self.violations.len()
    }
}

/// Aggregated verdict status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Success,
    Failed,
}

/// Loop decision derived from the latest verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopSignal {
    /// Stop iterating: both checks passed.
    Exit,
    /// Keep iterating if the budget allows.
    Continue,
}
