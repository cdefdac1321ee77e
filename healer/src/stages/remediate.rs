//! Remediation stages wrapping the external capabilities.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::core::stage::{Stage, StageSignal};
use crate::core::state::{StateKey, StateStore};
use crate::io::config::HealerConfig;
use crate::io::files::declarative_files;
use crate::io::process::CommandRunner;
use crate::io::remediator::{RemediationMode, RemediationRequest, Remediator};
use crate::syntax::SyntaxValidator;

pub const REMEDIATION_SKIPPED: &str = "skipped - no known errors to remediate";

/// Asks the remediation capability to fix the currently known errors.
pub struct RemediateStage<'a> {
    remediator: &'a dyn Remediator,
    config: &'a HealerConfig,
    log_dir: Option<PathBuf>,
}

impl<'a> RemediateStage<'a> {
    /// `log_dir` is the run directory; logs land in `<log_dir>/<attempt>/`.
    pub fn new(
        remediator: &'a dyn Remediator,
        config: &'a HealerConfig,
        log_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            remediator,
            config,
            log_dir,
        }
    }
}

impl Stage for RemediateStage<'_> {
    fn name(&self) -> &'static str {
        "remediate"
    }

    fn reads(&self) -> &'static [StateKey] {
        &[StateKey::PolicyViolations, StateKey::SyntaxErrors]
    }

    fn writes(&self) -> &'static [StateKey] {
        &[StateKey::FixesApplied]
    }

    fn run(&self, state: &mut StateStore) -> Result<StageSignal> {
        let violations = state.policy_violations().to_vec();
        let syntax_errors = state.syntax_errors().to_vec();
        if violations.is_empty() && syntax_errors.is_empty() {
            debug!("nothing known to fix");
            state.record_fixes_applied(REMEDIATION_SKIPPED);
            return Ok(StageSignal::Continue);
        }

        let request = RemediationRequest {
            mode: RemediationMode::Policy,
            working_copy: state.working_copy().to_path_buf(),
            iteration: state.attempt(),
            violations,
            syntax_errors,
            files: declarative_files(state.working_copy(), &self.config.artifacts_dir),
            timeout: self.config.remediation.timeout(),
            log_path: self
                .log_dir
                .as_ref()
                .map(|dir| dir.join(state.attempt().to_string()).join("remediation.log")),
        };

        match self.remediator.remediate(&request) {
            Ok(report) => {
                info!(files_modified = report.files_modified.len(), "remediation returned");
                state.record_fixes_applied(report.fixes_applied);
                Ok(StageSignal::Continue)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "remediation failed");
                state.record_fixes_applied(format!("remediation failed: {err:#}"));
                Err(err).context("remediation capability failed")
            }
        }
    }
}

/// Runs the syntax-fix capability when the working copy does not validate.
///
/// The check it runs is not recorded, except that a backend init it triggered
/// still counts toward `backend_initialized`.
pub struct SyntaxFixStage<'a> {
    fixer: Option<&'a dyn Remediator>,
    runner: &'a dyn CommandRunner,
    config: &'a HealerConfig,
    log_dir: Option<PathBuf>,
}

impl<'a> SyntaxFixStage<'a> {
    pub fn new(
        fixer: Option<&'a dyn Remediator>,
        runner: &'a dyn CommandRunner,
        config: &'a HealerConfig,
        log_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            fixer,
            runner,
            config,
            log_dir,
        }
    }
}

impl Stage for SyntaxFixStage<'_> {
    fn name(&self) -> &'static str {
        "syntax_fix"
    }

    fn reads(&self) -> &'static [StateKey] {
        &[]
    }

    fn writes(&self) -> &'static [StateKey] {
        &[StateKey::SyntaxFixesApplied, StateKey::BackendInitialized]
    }

    fn run(&self, state: &mut StateStore) -> Result<StageSignal> {
        let Some(fixer) = self.fixer else {
            return Ok(StageSignal::Continue);
        };

        let check = SyntaxValidator::new(self.runner, self.config).validate(state.working_copy());
        if check.initialized && !state.backend_initialized() {
            state.mark_backend_initialized();
        }
        if check.result.valid {
            debug!("syntax valid, no syntax fix needed");
            return Ok(StageSignal::Continue);
        }

        let request = RemediationRequest {
            mode: RemediationMode::Syntax,
            working_copy: state.working_copy().to_path_buf(),
            iteration: state.attempt(),
            violations: Vec::new(),
            syntax_errors: check.result.errors,
            files: declarative_files(state.working_copy(), &self.config.artifacts_dir),
            timeout: self.config.syntax_fix.timeout(),
            log_path: self
                .log_dir
                .as_ref()
                .map(|dir| dir.join(state.attempt().to_string()).join("syntax_fix.log")),
        };

        match fixer.remediate(&request) {
            Ok(report) => {
                state.record_syntax_fixes_applied(report.fixes_applied);
                Ok(StageSignal::Continue)
            }
            Err(err) => {
                state.record_syntax_fixes_applied(format!("syntax fix failed: {err:#}"));
                Err(err).context("syntax-fix capability failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{EvaluationResult, Violation};
    use crate::test_support::{
        ScriptedCommandRunner, ScriptedRemediator, ScriptedResponse, TestWorkspace,
        validate_error_json, validate_ok_json,
    };

    #[test]
    fn remediation_is_skipped_without_known_errors() {
        let config = HealerConfig::default();
        let remediator = ScriptedRemediator::new();
        let mut state = StateStore::new("/work", "/policy");

        RemediateStage::new(&remediator, &config, None)
            .run(&mut state)
            .expect("run");

        assert!(remediator.requests().is_empty());
        assert_eq!(state.fixes_applied(), Some(REMEDIATION_SKIPPED));
    }

    #[test]
    fn remediation_receives_violations_and_files() {
        let ws = TestWorkspace::new().expect("workspace");
        let config = HealerConfig::default();
        let remediator = ScriptedRemediator::new().fixes("encrypted the bucket");
        let mut state = StateStore::new(ws.working_copy(), ws.policy_path());
        state.begin_attempt(2);
        state.record_evaluation(EvaluationResult::evaluated(
            serde_json::json!({}),
            vec![Violation::new("s3", "bucket must be encrypted")],
        ));

        RemediateStage::new(&remediator, &config, Some(ws.root().join("run")))
            .run(&mut state)
            .expect("run");

        let requests = remediator.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].mode, RemediationMode::Policy);
        assert_eq!(requests[0].iteration, 2);
        assert_eq!(requests[0].violations.len(), 1);
        assert_eq!(requests[0].files, vec![PathBuf::from("main.tf")]);
        assert_eq!(
            requests[0].log_path,
            Some(ws.root().join("run/2/remediation.log"))
        );
        assert_eq!(state.fixes_applied(), Some("encrypted the bucket"));
    }

    #[test]
    fn remediation_failure_is_recorded_and_returned() {
        let config = HealerConfig::default();
        let remediator = ScriptedRemediator::new().fails("capability crashed");
        let mut state = StateStore::new("/work", "/policy");
        state.record_evaluation(EvaluationResult::evaluated(
            serde_json::json!({}),
            vec![Violation::new("s3", "x")],
        ));

        let err = RemediateStage::new(&remediator, &config, None)
            .run(&mut state)
            .expect_err("fails");
        assert!(format!("{err:#}").contains("capability crashed"));
        assert_eq!(
            state.fixes_applied(),
            Some("remediation failed: capability crashed")
        );
    }

    #[test]
    fn syntax_fix_without_fixer_does_nothing() {
        let config = HealerConfig::default();
        let runner = ScriptedCommandRunner::new();
        let mut state = StateStore::new("/work", "/policy");

        SyntaxFixStage::new(None, &runner, &config, None)
            .run(&mut state)
            .expect("run");
        assert!(runner.calls().is_empty());
        assert!(state.take_touched().is_empty());
    }

    #[test]
    fn syntax_fix_runs_only_when_invalid_and_touches_no_policy_state() {
        let config = HealerConfig::default();
        let fixer = ScriptedRemediator::new().fixes("closed the brace");
        let runner = ScriptedCommandRunner::new()
            .on(
                "validate",
                ScriptedResponse::exit(1, &validate_error_json("Unclosed block", "main.tf", 9), ""),
            )
            .on("validate", ScriptedResponse::ok(&validate_ok_json()));
        let mut state = StateStore::new("/work", "/policy");
        let stage = SyntaxFixStage::new(Some(&fixer), &runner, &config, None);

        stage.run(&mut state).expect("run");
        let touched = state.take_touched();
        assert_eq!(touched.into_iter().collect::<Vec<_>>(), vec![StateKey::SyntaxFixesApplied]);
        assert_eq!(state.syntax_fixes_applied(), Some("closed the brace"));
        assert!(state.validation().is_none());

        let requests = fixer.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].mode, RemediationMode::Syntax);
        assert!(requests[0].violations.is_empty());
        assert_eq!(requests[0].syntax_errors[0].line, Some(9));

        stage.run(&mut state).expect("run");
        assert_eq!(fixer.requests().len(), 1);
    }

    /// An init run by the pre-fix check is not lost when the fix follows.
    #[test]
    fn syntax_fix_records_backend_init_from_its_check() {
        let config = HealerConfig::default();
        let fixer = ScriptedRemediator::new().fixes("pinned the provider block");
        let runner = ScriptedCommandRunner::new()
            .on(
                "validate",
                ScriptedResponse::exit(1, "", "Error: Missing required provider"),
            )
            .on("init", ScriptedResponse::ok("initialized"))
            .on(
                "validate",
                ScriptedResponse::exit(1, &validate_error_json("Unclosed block", "main.tf", 2), ""),
            );
        let mut state = StateStore::new("/work", "/policy");

        SyntaxFixStage::new(Some(&fixer), &runner, &config, None)
            .run(&mut state)
            .expect("run");

        assert_eq!(runner.subcommands(), vec!["validate", "init", "validate"]);
        assert!(state.backend_initialized());
        let touched: Vec<_> = state.take_touched().into_iter().collect();
        assert!(touched.contains(&StateKey::BackendInitialized));
        assert!(touched.contains(&StateKey::SyntaxFixesApplied));
        assert_eq!(fixer.requests().len(), 1);
        assert_eq!(fixer.requests()[0].syntax_errors[0].line, Some(2));
    }
}
