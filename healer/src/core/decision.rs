//! Loop decision: the single trigger for convergence.

use crate::core::types::LoopSignal;
use crate::core::verification::VerificationResult;

/// Decide whether the loop should stop.
///
/// Only `build_successful` is consulted. A missing verdict never exits.
pub fn decide(verification: Option<&VerificationResult>) -> LoopSignal {
    match verification {
        Some(result) if result.build_successful() => LoopSignal::Exit,
        _ => LoopSignal::Continue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ValidationError, Violation};

    #[test]
    fn exits_only_on_successful_build() {
        let ok = VerificationResult::new(true, &[], &[], 0);
        assert_eq!(decide(Some(&ok)), LoopSignal::Exit);

        let violations = vec![Violation::new("pkg", "still broken")];
        let not_ok = VerificationResult::new(true, &[], &violations, 0);
        assert_eq!(decide(Some(&not_ok)), LoopSignal::Continue);

        let errors = vec![ValidationError::new("bad")];
        let invalid = VerificationResult::new(false, &errors, &[], 3);
        assert_eq!(decide(Some(&invalid)), LoopSignal::Continue);
    }

    #[test]
    fn missing_verdict_continues() {
        assert_eq!(decide(None), LoopSignal::Continue);
    }
}
