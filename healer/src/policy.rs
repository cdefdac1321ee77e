//! Policy evaluation: init, fresh plan, JSON rendering, `opa eval`.

use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::policy_output::parse_policy_output;
use crate::core::types::{EvaluationResult, ToolFailure};
use crate::io::config::HealerConfig;
use crate::io::process::{CommandRunner, execute_checked};
use crate::io::tools::{Terraform, opa_eval};

const PROVIDER_CACHE_DIR: &str = ".terraform";

/// Outcome of one evaluator call.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRun {
    pub result: EvaluationResult,
    /// True once the backend is known to be initialized.
    pub initialized: bool,
}

pub struct PolicyEvaluator<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    config: &'a HealerConfig,
}

impl<'a, R: CommandRunner + ?Sized> PolicyEvaluator<'a, R> {
    pub fn new(runner: &'a R, config: &'a HealerConfig) -> Self {
        Self { runner, config }
    }

    /// Evaluate the working copy against `policy_path`.
    ///
    /// Callers must only invoke this over syntactically valid input. Every call
    /// regenerates the plan. Tool failures become a failed result.
    #[instrument(skip_all, fields(working_copy = %working_copy.display()))]
    pub fn evaluate(
        &self,
        working_copy: &Path,
        policy_path: &Path,
        backend_initialized: bool,
    ) -> PolicyRun {
        let mut initialized = backend_initialized;
        let result = match self.run_steps(working_copy, policy_path, &mut initialized) {
            Ok(result) => result,
            Err(failure) => {
                warn!(step = %failure.step, message = %failure.message, "policy evaluation failed");
                EvaluationResult::failed(failure)
            }
        };
        PolicyRun {
            result,
            initialized,
        }
    }

    fn run_steps(
        &self,
        working_copy: &Path,
        policy_path: &Path,
        initialized: &mut bool,
    ) -> Result<EvaluationResult, ToolFailure> {
        let tf = Terraform::new(self.config, working_copy);

        if !*initialized {
            if working_copy.join(PROVIDER_CACHE_DIR).is_dir() {
                debug!("provider cache present, skipping init");
            } else {
                info!("initializing terraform backend");
                execute_checked(self.runner, &tf.init())?;
            }
            *initialized = true;
        }

        execute_checked(self.runner, &tf.plan())?;

        let show = execute_checked(self.runner, &tf.show_json())?;
        let plan_json_path = tf.plan_json_path();
        fs::write(&plan_json_path, &show.stdout).map_err(|err| {
            ToolFailure::io(
                "terraform show",
                format!("write {}: {err}", plan_json_path.display()),
            )
        })?;

        let request = opa_eval(self.config, working_copy, policy_path);
        let eval = execute_checked(self.runner, &request)?;
        let raw: Value = serde_json::from_slice(&eval.stdout)
            .map_err(|err| ToolFailure::invalid_output(&request.label(), err.to_string()))?;

        let violations = parse_policy_output(&raw);
        debug!(violations = violations.len(), "policy evaluation finished");
        Ok(EvaluationResult::evaluated(raw, violations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{EVALUATION_FAILURE_RULE, EvaluationStatus, FailureKind, Severity};
    use crate::test_support::{
        ScriptedCommandRunner, ScriptedResponse, opa_deny, opa_output, tools_with_violations,
    };
    use serde_json::json;

    fn evaluate(runner: &ScriptedCommandRunner, working_copy: &Path, initialized: bool) -> PolicyRun {
        let config = HealerConfig::default();
        PolicyEvaluator::new(runner, &config).evaluate(
            working_copy,
            Path::new("/policies"),
            initialized,
        )
    }

    #[test]
    fn first_evaluation_initializes_then_plans() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = tools_with_violations(&["bucket must be encrypted"]);

        let run = evaluate(&runner, temp.path(), false);
        assert!(run.initialized);
        assert_eq!(run.result.status, EvaluationStatus::ViolationsFound);
        assert_eq!(run.result.violation_count(), 1);
        assert_eq!(runner.subcommands(), vec!["init", "plan", "show", "eval"]);

        let plan = fs::read_to_string(temp.path().join("tfplan.json")).expect("plan json");
        assert!(plan.contains("format_version"));
    }

    #[test]
    fn initialization_is_check_before_act() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = tools_with_violations(&[]);

        evaluate(&runner, temp.path(), true);
        fs::create_dir_all(temp.path().join(".terraform")).expect("mkdir");
        let run = evaluate(&runner, temp.path(), false);

        assert!(run.initialized);
        assert_eq!(run.result.status, EvaluationStatus::Passed);
        assert_eq!(runner.count("init"), 0);
        assert_eq!(runner.count("plan"), 2);
    }

    #[test]
    fn plan_failure_is_recorded_as_critical_violation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedCommandRunner::new()
            .on("plan", ScriptedResponse::exit(1, "", "Error: no credentials"));

        let run = evaluate(&runner, temp.path(), true);
        assert_eq!(run.result.status, EvaluationStatus::Failed);
        assert_eq!(run.result.violation_count(), 1);
        let violation = &run.result.violations[0];
        assert_eq!(violation.package_or_rule, EVALUATION_FAILURE_RULE);
        assert_eq!(violation.severity, Severity::Critical);
        assert!(violation.message.contains("terraform plan exited with status 1"));
        assert_eq!(runner.subcommands(), vec!["plan"]);
    }

    #[test]
    fn non_json_opa_output_is_invalid_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedCommandRunner::new()
            .on("plan", ScriptedResponse::ok(""))
            .on("show", ScriptedResponse::ok("{}"))
            .on("eval", ScriptedResponse::ok("not json"));

        let run = evaluate(&runner, temp.path(), true);
        let failure = run.result.failure.expect("failure");
        assert_eq!(failure.kind, FailureKind::InvalidOutput);
        assert_eq!(failure.step, "opa eval");
    }

    #[test]
    fn unexpected_json_shape_yields_no_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedCommandRunner::new()
            .on("plan", ScriptedResponse::ok(""))
            .on("show", ScriptedResponse::ok("{}"))
            .on("eval", ScriptedResponse::ok(r#"{"errors": []}"#));

        let run = evaluate(&runner, temp.path(), true);
        assert_eq!(run.result.status, EvaluationStatus::Passed);
        assert_eq!(run.result.violation_count(), 0);
        assert_eq!(run.result.raw_output, Some(json!({"errors": []})));
    }

    #[test]
    fn opa_eval_timeout_is_a_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedCommandRunner::new()
            .on("plan", ScriptedResponse::ok(""))
            .on("show", ScriptedResponse::ok("{}"))
            .on("eval", ScriptedResponse::timeout());

        let run = evaluate(&runner, temp.path(), true);
        assert_eq!(run.result.status, EvaluationStatus::Failed);
        assert_eq!(run.result.failure.expect("failure").kind, FailureKind::TimedOut);
    }

    #[test]
    fn violations_from_several_packages() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedCommandRunner::new()
            .on("plan", ScriptedResponse::ok(""))
            .on("show", ScriptedResponse::ok("{}"))
            .on(
                "eval",
                ScriptedResponse::ok(&opa_output(json!({
                    "s3": {"deny": ["a", "b"]},
                    "tags": {"violation": ["c"]}
                }))),
            );
        let run = evaluate(&runner, temp.path(), true);
        let messages: Vec<&str> = run
            .result
            .violations
            .iter()
            .map(|v| v.message.as_str())
            .collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
    }

    #[test]
    fn show_output_replaces_stale_plan_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("tfplan.json"), "stale").expect("write");
        let runner = ScriptedCommandRunner::new()
            .on("plan", ScriptedResponse::ok(""))
            .on("show", ScriptedResponse::ok(r#"{"fresh":true}"#))
            .on("eval", ScriptedResponse::ok(&opa_deny(&[])));

        evaluate(&runner, temp.path(), true);
        let plan = fs::read_to_string(temp.path().join("tfplan.json")).expect("read");
        assert_eq!(plan, r#"{"fresh":true}"#);
    }
}
