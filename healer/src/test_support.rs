//! Test-only doubles and fixtures.
//!
//! Nothing here spawns terraform or opa: tool behavior is scripted per
//! sub-command and every request is recorded for later assertions.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::io::config::{CommandConfig, HealerConfig};
use crate::io::log_sink::LogSink;
use crate::io::process::{CommandOutput, CommandRequest, CommandRunner};
use crate::io::remediator::{RemediationReport, RemediationRequest, Remediator};

/// One scripted reply for a command.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Output(CommandOutput),
    SpawnError(String),
}

impl ScriptedResponse {
    pub fn ok(stdout: &str) -> Self {
        Self::exit(0, stdout, "")
    }

    pub fn exit(code: i32, stdout: &str, stderr: &str) -> Self {
        Self::Output(CommandOutput {
            exit_code: Some(code),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            ..CommandOutput::default()
        })
    }

    pub fn timeout() -> Self {
        Self::Output(CommandOutput {
            exit_code: None,
            timed_out: true,
            ..CommandOutput::default()
        })
    }

    pub fn spawn_error(message: &str) -> Self {
        Self::SpawnError(message.to_string())
    }
}

/// Command runner keyed by [`CommandRequest::subcommand`].
///
/// Responses for a key are consumed in order; the last one repeats.
#[derive(Debug, Default)]
pub struct ScriptedCommandRunner {
    scripts: RefCell<BTreeMap<String, VecDeque<ScriptedResponse>>>,
    calls: RefCell<Vec<CommandRequest>>,
}

impl ScriptedCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `key` (builder style).
    pub fn on(self, key: &str, response: ScriptedResponse) -> Self {
        self.push(key, response);
        self
    }

    pub fn push(&self, key: &str, response: ScriptedResponse) {
        self.scripts
            .borrow_mut()
            .entry(key.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<CommandRequest> {
        self.calls.borrow().clone()
    }

    /// Sub-commands in call order, e.g. `["validate", "plan", "show", "eval"]`.
    pub fn subcommands(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(|call| call.subcommand().to_string())
            .collect()
    }

    pub fn count(&self, key: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.subcommand() == key)
            .count()
    }
}

impl CommandRunner for ScriptedCommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(request.clone());
        let mut scripts = self.scripts.borrow_mut();
        let queue = scripts
            .get_mut(request.subcommand())
            .ok_or_else(|| anyhow!("no scripted response for {}", request.label()))?;
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match response.ok_or_else(|| anyhow!("no scripted response for {}", request.label()))? {
            ScriptedResponse::Output(output) => Ok(output),
            ScriptedResponse::SpawnError(message) => Err(anyhow!(message)),
        }
    }
}

/// Remediator that records requests and replays scripted reports.
#[derive(Debug, Default)]
pub struct ScriptedRemediator {
    responses: RefCell<VecDeque<std::result::Result<String, String>>>,
    requests: RefCell<Vec<RemediationRequest>>,
}

impl ScriptedRemediator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with this summary (builder style).
    pub fn fixes(self, summary: &str) -> Self {
        self.responses.borrow_mut().push_back(Ok(summary.to_string()));
        self
    }

    /// Fail with this message (builder style).
    pub fn fails(self, message: &str) -> Self {
        self.responses
            .borrow_mut()
            .push_back(Err(message.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<RemediationRequest> {
        self.requests.borrow().clone()
    }
}

impl Remediator for ScriptedRemediator {
    fn remediate(&self, request: &RemediationRequest) -> Result<RemediationReport> {
        self.requests.borrow_mut().push(request.clone());
        let mut responses = self.responses.borrow_mut();
        let response = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        match response {
            Some(Ok(summary)) => Ok(RemediationReport::summary(summary)),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(RemediationReport::summary("no changes")),
        }
    }
}

/// Log sink that keeps lines in memory.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    lines: RefCell<Vec<String>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }
}

impl LogSink for MemoryLogSink {
    fn append_line(&self, line: &str) -> Result<()> {
        self.lines.borrow_mut().push(line.to_string());
        Ok(())
    }
}

/// Log sink whose writes always fail.
#[derive(Debug, Default)]
pub struct FailingLogSink;

impl LogSink for FailingLogSink {
    fn append_line(&self, _line: &str) -> Result<()> {
        Err(anyhow!("disk full"))
    }
}

/// `terraform validate -json` output for a valid configuration.
pub fn validate_ok_json() -> String {
    json!({
        "format_version": "1.0",
        "valid": true,
        "error_count": 0,
        "warning_count": 0,
        "diagnostics": []
    })
    .to_string()
}

/// `terraform validate -json` output with one error diagnostic.
pub fn validate_error_json(summary: &str, file: &str, line: u32) -> String {
    json!({
        "format_version": "1.0",
        "valid": false,
        "error_count": 1,
        "warning_count": 0,
        "diagnostics": [{
            "severity": "error",
            "summary": summary,
            "range": {"filename": file, "start": {"line": line, "column": 1}}
        }]
    })
    .to_string()
}

/// Minimal `terraform show -json` plan.
pub fn plan_json() -> String {
    json!({"format_version": "1.2", "resource_changes": []}).to_string()
}

/// `opa eval -f json` output with the given packages as the value.
pub fn opa_output(packages: Value) -> String {
    json!({"result": [{"expressions": [{"value": packages, "text": "data"}]}]}).to_string()
}

/// `opa eval -f json` output with `deny` messages in package `main`.
pub fn opa_deny(messages: &[&str]) -> String {
    opa_output(json!({"main": {"deny": messages}}))
}

/// Runner scripted for a clean validate and a policy evaluation that denies
/// with `messages` on every call.
pub fn tools_with_violations(messages: &[&str]) -> ScriptedCommandRunner {
    ScriptedCommandRunner::new()
        .on("validate", ScriptedResponse::ok(&validate_ok_json()))
        .on("init", ScriptedResponse::ok("Terraform has been successfully initialized!"))
        .on("plan", ScriptedResponse::ok("Plan: 1 to add, 0 to change, 0 to destroy."))
        .on("show", ScriptedResponse::ok(&plan_json()))
        .on("eval", ScriptedResponse::ok(&opa_deny(messages)))
}

/// Config for tests: git disabled and a remediation command set.
pub fn test_config() -> HealerConfig {
    let mut cfg = HealerConfig::default();
    cfg.git.enabled = false;
    cfg.remediation = CommandConfig {
        command: vec!["fix.sh".to_string()],
        timeout_secs: 60,
    };
    cfg
}

/// Scratch working copy with one terraform file and a policy directory.
pub struct TestWorkspace {
    temp: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let working_copy = temp.path().join("infra");
        fs::create_dir_all(working_copy.join(".terraform"))?;
        fs::write(
            working_copy.join("main.tf"),
            "resource \"aws_s3_bucket\" \"logs\" {\n  bucket = \"logs\"\n}\n",
        )?;
        let policy = temp.path().join("policy");
        fs::create_dir_all(&policy)?;
        fs::write(
            policy.join("s3.rego"),
            "package main\n\ndeny contains msg if {\n  false\n  msg := \"never\"\n}\n",
        )?;
        Ok(Self { temp })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn working_copy(&self) -> PathBuf {
        self.temp.path().join("infra")
    }

    pub fn policy_path(&self) -> PathBuf {
        self.temp.path().join("policy")
    }
}
