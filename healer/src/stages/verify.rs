//! Verification stages: syntax check, policy check, aggregation.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::core::stage::{Stage, StageSignal};
use crate::core::state::{StateKey, StateStore};
use crate::core::types::EvaluationResult;
use crate::core::verification::aggregate;
use crate::io::config::HealerConfig;
use crate::io::log_sink::LogSink;
use crate::io::process::CommandRunner;
use crate::policy::PolicyEvaluator;
use crate::syntax::SyntaxValidator;

const SYNTAX_WRITES: &[StateKey] = &[
    StateKey::SyntaxValid,
    StateKey::SyntaxErrors,
    StateKey::SyntaxValidationMessage,
    StateKey::BackendInitialized,
];

const POLICY_READS: &[StateKey] = &[StateKey::SyntaxValid, StateKey::BackendInitialized];

const POLICY_WRITES: &[StateKey] = &[
    StateKey::PolicyOutput,
    StateKey::PolicyViolations,
    StateKey::PolicyViolationCount,
    StateKey::PolicyEvaluationMessage,
    StateKey::BackendInitialized,
];

const AGGREGATOR_READS: &[StateKey] = &[
    StateKey::SyntaxValid,
    StateKey::SyntaxErrors,
    StateKey::PolicyViolations,
    StateKey::PolicyViolationCount,
    StateKey::IterationCount,
];

pub struct SyntaxValidatorStage<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a HealerConfig,
}

impl<'a> SyntaxValidatorStage<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a HealerConfig) -> Self {
        Self { runner, config }
    }
}

impl Stage for SyntaxValidatorStage<'_> {
    fn name(&self) -> &'static str {
        "syntax_validator"
    }

    fn reads(&self) -> &'static [StateKey] {
        &[]
    }

    fn writes(&self) -> &'static [StateKey] {
        SYNTAX_WRITES
    }

    fn run(&self, state: &mut StateStore) -> Result<StageSignal> {
        let run = SyntaxValidator::new(self.runner, self.config).validate(state.working_copy());
        if run.initialized && !state.backend_initialized() {
            state.mark_backend_initialized();
        }
        info!(
            valid = run.result.valid,
            errors = run.result.errors.len(),
            "{}",
            run.result.message
        );
        state.record_validation(run.result);
        Ok(StageSignal::Continue)
    }
}

/// Runs the policy evaluator, or records a skip when syntax is invalid.
pub struct PolicyEvaluatorStage<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a HealerConfig,
}

impl<'a> PolicyEvaluatorStage<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a HealerConfig) -> Self {
        Self { runner, config }
    }
}

impl Stage for PolicyEvaluatorStage<'_> {
    fn name(&self) -> &'static str {
        "policy_evaluator"
    }

    fn reads(&self) -> &'static [StateKey] {
        POLICY_READS
    }

    fn writes(&self) -> &'static [StateKey] {
        POLICY_WRITES
    }

    fn run(&self, state: &mut StateStore) -> Result<StageSignal> {
        if !state.syntax_valid() {
            debug!("syntax invalid, skipping policy evaluation");
            state.record_evaluation(EvaluationResult::skipped());
            return Ok(StageSignal::Continue);
        }

        let run = PolicyEvaluator::new(self.runner, self.config).evaluate(
            state.working_copy(),
            state.policy_path(),
            state.backend_initialized(),
        );
        if run.initialized && !state.backend_initialized() {
            state.mark_backend_initialized();
        }
        info!(violations = run.result.violation_count(), "{}", run.result.message);
        state.record_evaluation(run.result);
        Ok(StageSignal::Continue)
    }
}

/// Combines the latest results into a verdict and logs a summary line.
pub struct AggregatorStage<'a> {
    sink: &'a dyn LogSink,
}

impl<'a> AggregatorStage<'a> {
    pub fn new(sink: &'a dyn LogSink) -> Self {
        Self { sink }
    }
}

impl Stage for AggregatorStage<'_> {
    fn name(&self) -> &'static str {
        "verification_aggregator"
    }

    fn reads(&self) -> &'static [StateKey] {
        AGGREGATOR_READS
    }

    fn writes(&self) -> &'static [StateKey] {
        crate::core::state::VERIFICATION_KEYS
    }

    fn run(&self, state: &mut StateStore) -> Result<StageSignal> {
        let result = aggregate(state);
        let line = result.summary_line();
        info!(
            iteration = result.iteration_count(),
            build_successful = result.build_successful(),
            error_count = result.error_count(),
            "verification complete"
        );
        if let Err(err) = self.sink.append_line(&line) {
            warn!(err = %err, "failed to append verification summary");
        }
        state.record_verification(result);
        Ok(StageSignal::Continue)
    }
}
