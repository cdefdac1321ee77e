//! Verification verdict: recombination of syntax and policy results.

use serde::Serialize;

use crate::core::state::StateStore;
use crate::core::types::{RemainingError, ValidationError, VerificationStatus, Violation};

/// The aggregator's sole output record.
///
/// Fields are private so the only way to obtain a value is [`VerificationResult::new`],
/// which derives `build_successful` from its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    syntax_valid: bool,
    policy_violation_count: usize,
    combined_errors: Vec<RemainingError>,
    error_count: usize,
    iteration_count: u32,
    build_successful: bool,
    status: VerificationStatus,
}

impl VerificationResult {
    /// Build the verdict for one verification pass.
    ///
    /// `previous_iteration_count` is the count before this pass; the result carries
    /// it incremented by one.
    pub fn new(
        syntax_valid: bool,
        syntax_errors: &[ValidationError],
        violations: &[Violation],
        previous_iteration_count: u32,
    ) -> Self {
        let policy_violation_count = violations.len();
        let build_successful = syntax_valid && policy_violation_count == 0;

        let mut combined_errors = Vec::with_capacity(syntax_errors.len() + violations.len());
        combined_errors.extend(syntax_errors.iter().cloned().map(RemainingError::Syntax));
        combined_errors.extend(violations.iter().cloned().map(RemainingError::Policy));

        Self {
            syntax_valid,
            policy_violation_count,
            error_count: combined_errors.len(),
            combined_errors,
            iteration_count: previous_iteration_count + 1,
            build_successful,
            status: if build_successful {
                VerificationStatus::Success
            } else {
                VerificationStatus::Failed
            },
        }
    }

    pub fn syntax_valid(&self) -> bool {
        self.syntax_valid
    }

    pub fn policy_violation_count(&self) -> usize {
        self.policy_violation_count
    }

    pub fn combined_errors(&self) -> &[RemainingError] {
        &self.combined_errors
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn build_successful(&self) -> bool {
        self.build_successful
    }

    pub fn status(&self) -> VerificationStatus {
        self.status
    }

    pub fn syntax_error_count(&self) -> usize {
        self.error_count - self.policy_violation_count
    }

    /// One-line human-readable summary for the append-only build log.
    pub fn summary_line(&self) -> String {
        let status = match self.status {
            VerificationStatus::Success => "success",
            VerificationStatus::Failed => "failed",
        };
        format!(
            "verification iteration={} status={} syntax_valid={} syntax_errors={} policy_violations={} error_count={}",
            self.iteration_count,
            status,
            self.syntax_valid,
            self.syntax_error_count(),
            self.policy_violation_count,
            self.error_count
        )
    }
}

/// Combine the current syntax and policy results into a verdict.
///
/// Pure over `state`: an absent syntax result counts as invalid and an absent
/// iteration counter as zero.
pub fn aggregate(state: &StateStore) -> VerificationResult {
    VerificationResult::new(
        state.syntax_valid(),
        state.syntax_errors(),
        state.policy_violations(),
        state.iteration_count(),
    )
}
