//! Remediation capability abstraction.
//!
//! The [`Remediator`] trait decouples the loop from whatever edits the
//! declarative files. The loop never trusts a report to decide success; it
//! always re-verifies after the call returns. Tests use scripted remediators.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ValidationError, Violation};
use crate::io::process::{CommandOutput, CommandRequest, CommandRunner, execute_checked};

const REPORT_SCHEMA: &str = include_str!("../../schemas/remediation_report.schema.json");

/// Which errors a request asks the capability to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationMode {
    /// Policy violations (and any known syntax errors).
    Policy,
    /// Syntax errors only.
    Syntax,
}

/// Input handed to a remediation capability.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationRequest {
    pub mode: RemediationMode,
    pub working_copy: PathBuf,
    /// Loop-driver attempt this request belongs to (1-indexed).
    pub iteration: u32,
    pub violations: Vec<Violation>,
    pub syntax_errors: Vec<ValidationError>,
    /// Declarative files relative to `working_copy`.
    pub files: Vec<PathBuf>,
    #[serde(skip)]
    pub timeout: Duration,
    /// Where to write the capability's stdout/stderr.
    #[serde(skip)]
    pub log_path: Option<PathBuf>,
}

/// Self-reported outcome. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationReport {
    pub fixes_applied: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
}

impl RemediationReport {
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            fixes_applied: summary.into(),
            files_modified: Vec::new(),
        }
    }
}

/// Abstraction over remediation backends.
pub trait Remediator {
    /// Attempt to fix the requested errors in place. Best effort.
    fn remediate(&self, request: &RemediationRequest) -> Result<RemediationReport>;
}

/// Remediator that spawns a configured command in the working copy.
///
/// The request is written to stdin as JSON. Stdout may be a JSON report;
/// anything else is taken verbatim as the summary.
pub struct CommandRemediator<'a, R: CommandRunner> {
    runner: &'a R,
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl<'a, R: CommandRunner> CommandRemediator<'a, R> {
    pub fn new(runner: &'a R, command: Vec<String>, output_limit_bytes: usize) -> Result<Self> {
        match command.first() {
            Some(program) if !program.trim().is_empty() => {}
            _ => return Err(anyhow!("remediation command must not be empty")),
        }
        Ok(Self {
            runner,
            command,
            output_limit_bytes,
        })
    }
}

impl<R: CommandRunner> Remediator for CommandRemediator<'_, R> {
    #[instrument(skip_all, fields(mode = ?request.mode, iteration = request.iteration))]
    fn remediate(&self, request: &RemediationRequest) -> Result<RemediationReport> {
        info!(
            violations = request.violations.len(),
            syntax_errors = request.syntax_errors.len(),
            files = request.files.len(),
            "starting remediation command"
        );
        let input = serde_json::to_vec(request).context("serialize remediation request")?;
        let command = CommandRequest::new(
            &self.command[0],
            &request.working_copy,
            request.timeout,
            self.output_limit_bytes,
        )
        .args(self.command[1..].iter().cloned())
        .stdin(input);

        let result = execute_checked(self.runner, &command);
        if let Some(log_path) = &request.log_path {
            let logged = match &result {
                Ok(output) => write_remediation_log(log_path, output),
                Err(failure) => write_text(log_path, &format!("{}\n{}", failure.message, failure.stderr)),
            };
            if let Err(err) = logged {
                warn!(err = %err, "failed to write remediation log");
            }
        }

        let output = result.map_err(|failure| anyhow!(failure.message))?;
        let report = parse_report(&output.stdout_text());
        debug!(files_modified = report.files_modified.len(), "remediation finished");
        Ok(report)
    }
}

/// Interpret remediation stdout.
///
/// A JSON object matching the report schema is used as-is; any other output is
/// used verbatim (trimmed) as the summary.
pub fn parse_report(stdout: &str) -> RemediationReport {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return RemediationReport::summary("remediation command produced no summary");
    }
    let Ok(instance) = serde_json::from_str::<Value>(trimmed) else {
        return RemediationReport::summary(trimmed);
    };
    match validate_report(&instance) {
        Ok(()) => match serde_json::from_value::<RemediationReport>(instance) {
            Ok(report) => report,
            Err(err) => {
                warn!(err = %err, "report matched schema but did not deserialize");
                RemediationReport::summary(trimmed)
            }
        },
        Err(err) => {
            debug!(err = %err, "stdout is JSON but not a remediation report");
            RemediationReport::summary(trimmed)
        }
    }
}

fn validate_report(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(REPORT_SCHEMA).context("parse report schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile report schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!("schema validation failed: {}", messages.join("; ")));
    }
    Ok(())
}

fn write_remediation_log(path: &Path, output: &CommandOutput) -> Result<()> {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_text());
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_text());
    buf.push_str(&output.truncated_notice("remediation"));
    write_text(path, &buf)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create remediation log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write remediation log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedCommandRunner, ScriptedResponse};

    fn request(dir: &Path) -> RemediationRequest {
        RemediationRequest {
            mode: RemediationMode::Policy,
            working_copy: dir.to_path_buf(),
            iteration: 2,
            violations: vec![Violation::new("s3", "bucket must be encrypted")],
            syntax_errors: Vec::new(),
            files: vec![PathBuf::from("main.tf")],
            timeout: Duration::from_secs(5),
            log_path: Some(dir.join("logs/remediation.log")),
        }
    }

    #[test]
    fn report_json_is_validated_against_schema() {
        let report = parse_report(r#"{"fixes_applied": "enabled SSE", "files_modified": ["main.tf"]}"#);
        assert_eq!(report.fixes_applied, "enabled SSE");
        assert_eq!(report.files_modified, vec!["main.tf"]);

        let report = parse_report(r#"{"fixes_applied": 3}"#);
        assert_eq!(report.fixes_applied, r#"{"fixes_applied": 3}"#);
        assert!(report.files_modified.is_empty());
    }

    #[test]
    fn plain_stdout_is_used_verbatim() {
        assert_eq!(
            parse_report("  added tags to 2 resources\n").fixes_applied,
            "added tags to 2 resources"
        );
        assert_eq!(
            parse_report("").fixes_applied,
            "remediation command produced no summary"
        );
    }

    /// Verifies the command receives the request on stdin and its log is written.
    #[test]
    fn command_remediator_sends_request_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedCommandRunner::new()
            .on("fix.sh", ScriptedResponse::ok(r#"{"fixes_applied": "done"}"#));
        let remediator =
            CommandRemediator::new(&runner, vec!["fix.sh".to_string()], 1000).expect("new");

        let report = remediator.remediate(&request(temp.path())).expect("remediate");
        assert_eq!(report.fixes_applied, "done");

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        let stdin: Value =
            serde_json::from_slice(calls[0].stdin.as_deref().expect("stdin")).expect("json");
        assert_eq!(stdin["mode"], "policy");
        assert_eq!(stdin["iteration"], 2);
        assert_eq!(stdin["violations"][0]["message"], "bucket must be encrypted");
        assert_eq!(stdin["files"][0], "main.tf");

        let log = fs::read_to_string(temp.path().join("logs/remediation.log")).expect("log");
        assert!(log.contains("=== stdout ==="));
    }

    #[test]
    fn command_failure_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedCommandRunner::new()
            .on("fix.sh", ScriptedResponse::exit(4, "", "model unavailable"));
        let remediator =
            CommandRemediator::new(&runner, vec!["fix.sh".to_string()], 1000).expect("new");

        let err = remediator
            .remediate(&request(temp.path()))
            .expect_err("should fail");
        assert!(err.to_string().contains("exited with status 4"));
        let log = fs::read_to_string(temp.path().join("logs/remediation.log")).expect("log");
        assert!(log.contains("model unavailable"));
    }

    #[test]
    fn empty_command_is_rejected() {
        let runner = ScriptedCommandRunner::new();
        assert!(CommandRemediator::new(&runner, Vec::new(), 10).is_err());
        assert!(CommandRemediator::new(&runner, vec![" ".to_string()], 10).is_err());
    }
}
