//! Shared state store read and written by every stage of a workflow run.
//!
//! The store is an explicit typed context passed by `&mut` through each stage.
//! Fields are private; every setter records the [`StateKey`]s it wrote so the
//! loop driver can compare them with the stage's declared write set.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::core::types::{
    EvaluationResult, LoopSignal, ValidationError, ValidationResult, Violation,
};
use crate::core::verification::VerificationResult;

/// Names of the values held in the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKey {
    SyntaxValid,
    SyntaxErrors,
    SyntaxValidationMessage,
    PolicyOutput,
    PolicyViolations,
    PolicyViolationCount,
    PolicyEvaluationMessage,
    BackendInitialized,
    IterationCount,
    VerificationResult,
    BuildSuccessful,
    RemainingErrors,
    ErrorCount,
    BuildStatus,
    FixesApplied,
    SyntaxFixesApplied,
    LoopDecision,
    StageFailures,
}

impl StateKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SyntaxValid => "syntax_valid",
            Self::SyntaxErrors => "syntax_errors",
            Self::SyntaxValidationMessage => "syntax_validation_message",
            Self::PolicyOutput => "policy_output",
            Self::PolicyViolations => "policy_violations",
            Self::PolicyViolationCount => "policy_violation_count",
            Self::PolicyEvaluationMessage => "policy_evaluation_message",
            Self::BackendInitialized => "backend_initialized",
            Self::IterationCount => "iteration_count",
            Self::VerificationResult => "verification_result",
            Self::BuildSuccessful => "build_successful",
            Self::RemainingErrors => "remaining_errors",
            Self::ErrorCount => "error_count",
            Self::BuildStatus => "build_status",
            Self::FixesApplied => "fixes_applied",
            Self::SyntaxFixesApplied => "syntax_fixes_applied",
            Self::LoopDecision => "loop_decision",
            Self::StageFailures => "stage_failures",
        }
    }
}

/// Keys written by [`StateStore::record_validation`].
pub const SYNTAX_KEYS: &[StateKey] = &[
    StateKey::SyntaxValid,
    StateKey::SyntaxErrors,
    StateKey::SyntaxValidationMessage,
];

/// Keys written by [`StateStore::record_evaluation`].
pub const POLICY_KEYS: &[StateKey] = &[
    StateKey::PolicyOutput,
    StateKey::PolicyViolations,
    StateKey::PolicyViolationCount,
    StateKey::PolicyEvaluationMessage,
];

/// Keys written by [`StateStore::record_verification`].
pub const VERIFICATION_KEYS: &[StateKey] = &[
    StateKey::IterationCount,
    StateKey::VerificationResult,
    StateKey::BuildSuccessful,
    StateKey::RemainingErrors,
    StateKey::ErrorCount,
    StateKey::BuildStatus,
];

/// A stage error that was recorded instead of aborting the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub stage: String,
    /// Loop-driver attempt during which the failure happened (1-indexed).
    pub attempt: u32,
    pub message: String,
}

/// Blackboard shared by all stages for the lifetime of one workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct StateStore {
    working_copy: PathBuf,
    policy_path: PathBuf,
    /// Loop-driver attempt in progress (1-indexed, 0 before the loop starts).
    /// Distinct from `iteration_count`, which counts verification passes.
    attempt: u32,
    validation: Option<ValidationResult>,
    evaluation: Option<EvaluationResult>,
    backend_initialized: bool,
    iteration_count: u32,
    verification: Option<VerificationResult>,
    fixes_applied: Option<String>,
    syntax_fixes_applied: Option<String>,
    loop_decision: Option<LoopSignal>,
    stage_failures: Vec<StageFailure>,
    #[serde(skip)]
    touched: BTreeSet<StateKey>,
}

impl StateStore {
    pub fn new(working_copy: impl Into<PathBuf>, policy_path: impl Into<PathBuf>) -> Self {
        Self {
            working_copy: working_copy.into(),
            policy_path: policy_path.into(),
            attempt: 0,
            validation: None,
            evaluation: None,
            backend_initialized: false,
            iteration_count: 0,
            verification: None,
            fixes_applied: None,
            syntax_fixes_applied: None,
            loop_decision: None,
            stage_failures: Vec::new(),
            touched: BTreeSet::new(),
        }
    }

    pub fn working_copy(&self) -> &Path {
        &self.working_copy
    }

    pub fn policy_path(&self) -> &Path {
        &self.policy_path
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Owned by the loop driver; not a stage-visible key.
    pub(crate) fn begin_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    // Syntax

    pub fn validation(&self) -> Option<&ValidationResult> {
        self.validation.as_ref()
    }

    /// False until a syntax check has run and passed.
    pub fn syntax_valid(&self) -> bool {
        self.validation.as_ref().is_some_and(|v| v.valid)
    }

    pub fn syntax_errors(&self) -> &[ValidationError] {
        self.validation
            .as_ref()
            .map_or(&[], |v| v.errors.as_slice())
    }

    pub fn syntax_validation_message(&self) -> Option<&str> {
        self.validation.as_ref().map(|v| v.message.as_str())
    }

    pub fn record_validation(&mut self, result: ValidationResult) {
        self.validation = Some(result);
        self.touch(SYNTAX_KEYS);
    }

    // Policy

    pub fn evaluation(&self) -> Option<&EvaluationResult> {
        self.evaluation.as_ref()
    }

    pub fn policy_output(&self) -> Option<&Value> {
        self.evaluation.as_ref().and_then(|e| e.raw_output.as_ref())
    }

    pub fn policy_violations(&self) -> &[Violation] {
        self.evaluation
            .as_ref()
            .map_or(&[], |e| e.violations.as_slice())
    }

    pub fn policy_violation_count(&self) -> usize {
        self.evaluation
            .as_ref()
            .map_or(0, EvaluationResult::violation_count)
    }

    pub fn policy_evaluation_message(&self) -> Option<&str> {
        self.evaluation.as_ref().map(|e| e.message.as_str())
    }

    pub fn record_evaluation(&mut self, result: EvaluationResult) {
        self.evaluation = Some(result);
        self.touch(POLICY_KEYS);
    }

    pub fn backend_initialized(&self) -> bool {
        self.backend_initialized
    }

    pub fn mark_backend_initialized(&mut self) {
        self.backend_initialized = true;
        self.touch(&[StateKey::BackendInitialized]);
    }

    // Verification

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn verification(&self) -> Option<&VerificationResult> {
        self.verification.as_ref()
    }

    pub fn record_verification(&mut self, result: VerificationResult) {
        self.iteration_count = result.iteration_count();
        self.verification = Some(result);
        self.touch(VERIFICATION_KEYS);
    }

    // Remediation

    pub fn fixes_applied(&self) -> Option<&str> {
        self.fixes_applied.as_deref()
    }

    pub fn record_fixes_applied(&mut self, summary: impl Into<String>) {
        self.fixes_applied = Some(summary.into());
        self.touch(&[StateKey::FixesApplied]);
    }

    pub fn syntax_fixes_applied(&self) -> Option<&str> {
        self.syntax_fixes_applied.as_deref()
    }

    pub fn record_syntax_fixes_applied(&mut self, summary: impl Into<String>) {
        self.syntax_fixes_applied = Some(summary.into());
        self.touch(&[StateKey::SyntaxFixesApplied]);
    }

    // Control

    pub fn loop_decision(&self) -> Option<LoopSignal> {
        self.loop_decision
    }

    pub fn record_loop_decision(&mut self, signal: LoopSignal) {
        self.loop_decision = Some(signal);
        self.touch(&[StateKey::LoopDecision]);
    }

    pub fn stage_failures(&self) -> &[StageFailure] {
        &self.stage_failures
    }

    pub fn record_stage_failure(&mut self, failure: StageFailure) {
        self.stage_failures.push(failure);
        self.touch(&[StateKey::StageFailures]);
    }

    /// Drain the set of keys written since the last call.
    pub fn take_touched(&mut self) -> BTreeSet<StateKey> {
        std::mem::take(&mut self.touched)
    }

    fn touch(&mut self, keys: &[StateKey]) {
        self.touched.extend(keys.iter().copied());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StateStore {
        StateStore::new("/work", "/policy")
    }

    #[test]
    fn empty_store_reads_defaults() {
        let state = state();
        assert!(!state.syntax_valid());
        assert!(state.syntax_errors().is_empty());
        assert!(state.policy_violations().is_empty());
        assert_eq!(state.policy_violation_count(), 0);
        assert_eq!(state.iteration_count(), 0);
        assert!(state.verification().is_none());
        assert!(!state.backend_initialized());
    }

    #[test]
    fn setters_record_touched_keys() {
        let mut state = state();
        state.record_validation(ValidationResult::passed(String::new(), false));
        state.mark_backend_initialized();

        let touched = state.take_touched();
        assert!(touched.contains(&StateKey::SyntaxValid));
        assert!(touched.contains(&StateKey::SyntaxErrors));
        assert!(touched.contains(&StateKey::BackendInitialized));
        assert!(!touched.contains(&StateKey::PolicyViolations));

        assert!(state.take_touched().is_empty());
    }

    #[test]
    fn writes_are_last_write_wins() {
        let mut state = state();
        state.record_evaluation(EvaluationResult::evaluated(
            serde_json::json!({}),
            vec![Violation::new("pkg", "a")],
        ));
        state.record_evaluation(EvaluationResult::skipped());
        assert_eq!(state.policy_violation_count(), 0);
        assert!(state.policy_output().is_none());
        assert_eq!(
            state.policy_evaluation_message(),
            Some("skipped - syntax validation failed")
        );
    }

    #[test]
    fn record_verification_advances_iteration_count() {
        let mut state = state();
        state.record_verification(VerificationResult::new(false, &[], &[], 0));
        assert_eq!(state.iteration_count(), 1);
        state.record_verification(VerificationResult::new(false, &[], &[], 1));
        assert_eq!(state.iteration_count(), 2);
    }

    #[test]
    fn key_names_are_snake_case() {
        assert_eq!(StateKey::PolicyViolationCount.as_str(), "policy_violation_count");
        let json = serde_json::to_value(StateKey::BuildSuccessful).expect("serialize");
        assert_eq!(json, "build_successful");
    }
}
