//! Syntax validation with a single init-and-recheck recovery.

use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::core::syntax_output::{extract_validation_errors, is_recoverable_failure};
use crate::core::types::ValidationResult;
use crate::io::config::HealerConfig;
use crate::io::process::{CommandOutput, CommandRunner, execute, execute_checked};
use crate::io::tools::Terraform;

/// Outcome of one validator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxRun {
    pub result: ValidationResult,
    /// True when the recovery init ran and succeeded.
    pub initialized: bool,
}

/// Recovery states. Each is visited at most once per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Check,
    Init,
    Recheck,
}

pub struct SyntaxValidator<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    config: &'a HealerConfig,
}

impl<'a, R: CommandRunner + ?Sized> SyntaxValidator<'a, R> {
    pub fn new(runner: &'a R, config: &'a HealerConfig) -> Self {
        Self { runner, config }
    }

    /// Check the working copy.
    ///
    /// A failure naming missing provider or module metadata triggers exactly one
    /// init followed by exactly one more check. Nothing here returns an error:
    /// tool failures become an invalid result.
    #[instrument(skip_all, fields(working_copy = %working_copy.display()))]
    pub fn validate(&self, working_copy: &Path) -> SyntaxRun {
        let tf = Terraform::new(self.config, working_copy);
        let mut step = Step::Check;
        let mut initialized = false;

        loop {
            match step {
                Step::Check | Step::Recheck => {
                    let init_attempted = step == Step::Recheck;
                    let output = match execute(self.runner, &tf.validate()) {
                        Ok(output) => output,
                        Err(failure) => {
                            warn!(message = %failure.message, "terraform validate did not complete");
                            return SyntaxRun {
                                result: ValidationResult::tool_failure(failure, init_attempted),
                                initialized,
                            };
                        }
                    };
                    if output.success() {
                        debug!(init_attempted, "syntax validation passed");
                        return SyntaxRun {
                            result: ValidationResult::passed(output.combined_text(), init_attempted),
                            initialized,
                        };
                    }
                    if step == Step::Check && is_recoverable_failure(&output.combined_text()) {
                        info!("missing provider metadata, running terraform init once");
                        step = Step::Init;
                        continue;
                    }
                    return SyntaxRun {
                        result: invalid(&output, init_attempted),
                        initialized,
                    };
                }
                Step::Init => match execute_checked(self.runner, &tf.init()) {
                    Ok(_) => {
                        initialized = true;
                        step = Step::Recheck;
                    }
                    Err(failure) => {
                        warn!(message = %failure.message, "terraform init failed");
                        return SyntaxRun {
                            result: ValidationResult::tool_failure(failure, true),
                            initialized,
                        };
                    }
                },
            }
        }
    }
}

fn invalid(output: &CommandOutput, init_attempted: bool) -> ValidationResult {
    let errors = extract_validation_errors(
        &output.stdout_text(),
        &output.stderr_text(),
        output.exit_code,
    );
    debug!(errors = errors.len(), init_attempted, "syntax validation failed");
    ValidationResult::failed(errors, output.combined_text(), init_attempted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FailureKind;
    use crate::test_support::{
        ScriptedCommandRunner, ScriptedResponse, validate_error_json, validate_ok_json,
    };

    const MISSING_PROVIDER: &str = "Error: Missing required provider\n\nThis configuration requires provider registry.terraform.io/hashicorp/aws";

    fn validate(runner: &ScriptedCommandRunner) -> SyntaxRun {
        let config = HealerConfig::default();
        SyntaxValidator::new(runner, &config).validate(Path::new("/work"))
    }

    #[test]
    fn passing_check_runs_validate_once() {
        let runner =
            ScriptedCommandRunner::new().on("validate", ScriptedResponse::ok(&validate_ok_json()));
        let run = validate(&runner);
        assert!(run.result.valid);
        assert!(run.result.errors.is_empty());
        assert!(!run.result.init_attempted);
        assert!(!run.initialized);
        assert_eq!(runner.subcommands(), vec!["validate"]);
    }

    #[test]
    fn ordinary_failure_is_not_retried() {
        let runner = ScriptedCommandRunner::new().on(
            "validate",
            ScriptedResponse::exit(1, &validate_error_json("Unsupported argument", "main.tf", 3), ""),
        );
        let run = validate(&runner);
        assert!(!run.result.valid);
        assert_eq!(run.result.errors.len(), 1);
        assert_eq!(run.result.errors[0].line, Some(3));
        assert_eq!(runner.subcommands(), vec!["validate"]);
    }

    #[test]
    fn missing_provider_triggers_one_init_and_one_recheck() {
        let runner = ScriptedCommandRunner::new()
            .on("validate", ScriptedResponse::exit(1, "", MISSING_PROVIDER))
            .on("validate", ScriptedResponse::ok(&validate_ok_json()))
            .on("init", ScriptedResponse::ok("initialized"));
        let run = validate(&runner);
        assert!(run.result.valid);
        assert!(run.result.init_attempted);
        assert!(run.initialized);
        assert_eq!(runner.subcommands(), vec!["validate", "init", "validate"]);
    }

    #[test]
    fn recheck_failure_is_final_even_if_still_recoverable() {
        let runner = ScriptedCommandRunner::new()
            .on("validate", ScriptedResponse::exit(1, "", MISSING_PROVIDER))
            .on("init", ScriptedResponse::ok("initialized"));
        let run = validate(&runner);
        assert!(!run.result.valid);
        assert!(run.result.init_attempted);
        assert!(!run.result.errors.is_empty());
        assert_eq!(runner.count("validate"), 2);
        assert_eq!(runner.count("init"), 1);
    }

    #[test]
    fn failed_init_stops_without_recheck() {
        let runner = ScriptedCommandRunner::new()
            .on("validate", ScriptedResponse::exit(1, "", MISSING_PROVIDER))
            .on("init", ScriptedResponse::exit(1, "", "Error: registry unreachable"));
        let run = validate(&runner);
        assert!(!run.result.valid);
        assert!(!run.initialized);
        let failure = run.result.failure.expect("failure recorded");
        assert_eq!(failure.step, "terraform init");
        assert_eq!(runner.subcommands(), vec!["validate", "init"]);
    }

    #[test]
    fn timeout_is_an_invalid_result_not_an_error() {
        let runner = ScriptedCommandRunner::new().on("validate", ScriptedResponse::timeout());
        let run = validate(&runner);
        assert!(!run.result.valid);
        assert_eq!(run.result.errors.len(), 1);
        let failure = run.result.failure.expect("failure recorded");
        assert_eq!(failure.kind, FailureKind::TimedOut);
    }

    #[test]
    fn missing_binary_is_an_invalid_result() {
        let runner = ScriptedCommandRunner::new()
            .on("validate", ScriptedResponse::spawn_error("No such file or directory"));
        let run = validate(&runner);
        assert!(!run.result.valid);
        assert_eq!(run.result.failure.expect("failure").kind, FailureKind::Spawn);
    }
}
