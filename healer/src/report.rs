//! Human-facing run summary and commit message rendering.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::state::StateStore;
use crate::core::types::RemainingError;
use crate::looping::LoopOutcome;

const SUMMARY_TEMPLATE: &str = include_str!("templates/summary.md");
const COMMIT_TEMPLATE: &str = include_str!("templates/commit_message.txt");

/// Inputs shared by the summary and the commit message.
#[derive(Debug, Clone, Copy)]
pub struct ReportInputs<'a> {
    pub run_id: &'a str,
    pub ceiling: u32,
    pub branch: Option<&'a str>,
    pub outcome: &'a LoopOutcome,
    pub state: &'a StateStore,
}

struct ReportEngine {
    env: Environment<'static>,
}

impl ReportEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.add_template("summary", SUMMARY_TEMPLATE)
            .context("load summary template")?;
        env.add_template("commit_message", COMMIT_TEMPLATE)
            .context("load commit message template")?;
        Ok(Self { env })
    }

    fn render(&self, name: &str, inputs: &ReportInputs<'_>) -> Result<String> {
        let outcome = inputs.outcome;
        let state = inputs.state;
        let remaining = outcome
            .verification
            .as_ref()
            .map(|v| v.combined_errors().to_vec())
            .unwrap_or_default();
        let (syntax_errors, policy_errors): (Vec<_>, Vec<_>) = remaining
            .iter()
            .partition(|err| matches!(err, RemainingError::Syntax(_)));
        let render_all = |errors: &[&RemainingError]| -> Vec<String> {
            errors.iter().map(ToString::to_string).collect()
        };

        let template = self
            .env
            .get_template(name)
            .with_context(|| format!("get template {name}"))?;
        let rendered = template
            .render(context! {
                run_id => inputs.run_id,
                terminal => outcome.terminal.as_str(),
                iterations => outcome.iterations,
                ceiling => inputs.ceiling,
                verification_passes => outcome.verification_passes,
                error_count => remaining.len(),
                syntax_valid => outcome.verification.as_ref().is_some_and(|v| v.syntax_valid()),
                policy_violation_count => outcome
                    .verification
                    .as_ref()
                    .map_or(0, |v| v.policy_violation_count()),
                working_copy => state.working_copy().display().to_string(),
                policy_path => state.policy_path().display().to_string(),
                branch => inputs.branch,
                remaining => remaining.iter().map(ToString::to_string).collect::<Vec<_>>(),
                syntax_errors => render_all(&syntax_errors),
                policy_errors => render_all(&policy_errors),
                fixes_applied => state.fixes_applied(),
                syntax_fixes_applied => state.syntax_fixes_applied(),
                stage_failures => state.stage_failures(),
            })
            .with_context(|| format!("render template {name}"))?;
        Ok(rendered)
    }
}

/// Render `summary.md` contents.
pub fn render_summary(inputs: &ReportInputs<'_>) -> Result<String> {
    ReportEngine::new()?.render("summary", inputs)
}

/// Render the commit message: a subject reflecting the terminal state and a
/// body itemizing remaining errors.
pub fn render_commit_message(inputs: &ReportInputs<'_>) -> Result<String> {
    let message = ReportEngine::new()?.render("commit_message", inputs)?;
    Ok(format!("{}\n", message.trim_end()))
}

/// Write the summary to `path`.
pub fn write_summary(path: &Path, inputs: &ReportInputs<'_>) -> Result<()> {
    let summary = render_summary(inputs)?;
    crate::io::iteration_log::write_text(path, &summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ValidationError, Violation};
    use crate::core::verification::VerificationResult;
    use crate::looping::LoopTerminal;

    fn outcome(terminal: LoopTerminal, verification: VerificationResult) -> LoopOutcome {
        LoopOutcome {
            terminal,
            iterations: verification.iteration_count(),
            verification_passes: verification.iteration_count(),
            verification: Some(verification),
        }
    }

    #[test]
    fn converged_summary_has_no_remaining_sections() {
        let state = StateStore::new("/work", "/policy");
        let outcome = outcome(
            LoopTerminal::Converged,
            VerificationResult::new(true, &[], &[], 1),
        );
        let inputs = ReportInputs {
            run_id: "20260101-120000",
            ceiling: 10,
            branch: Some("fix/auto-heal-20260101-120000"),
            outcome: &outcome,
            state: &state,
        };

        let summary = render_summary(&inputs).expect("render");
        assert!(summary.starts_with("# Remediation run 20260101-120000"));
        assert!(summary.contains("**Converged** after 2 of 10 iterations"));
        assert!(summary.contains("| Branch | `fix/auto-heal-20260101-120000` |"));
        assert!(!summary.contains("Remaining"));

        let message = render_commit_message(&inputs).expect("render");
        let subject = message.lines().next().expect("subject");
        assert_eq!(subject, "fix(iac): remediate policy violations (2 iterations)");
    }

    #[test]
    fn exhausted_summary_itemizes_errors_by_type() {
        let mut state = StateStore::new("/work", "/policy");
        state.record_fixes_applied("tried adding tags");
        let syntax = vec![ValidationError::new("Invalid block").at("main.tf", Some(3))];
        let violations = vec![Violation::new("s3", "bucket must be encrypted")];
        let outcome = outcome(
            LoopTerminal::Exhausted,
            VerificationResult::new(false, &syntax, &violations, 1),
        );
        let inputs = ReportInputs {
            run_id: "run-1",
            ceiling: 2,
            branch: None,
            outcome: &outcome,
            state: &state,
        };

        let summary = render_summary(&inputs).expect("render");
        assert!(summary.contains("**Exhausted** after 2 of 2 iterations with 2 remaining errors."));
        assert!(summary.contains("## Remaining syntax errors (1)"));
        assert!(summary.contains("- [syntax] Invalid block (main.tf:3)"));
        assert!(summary.contains("## Remaining policy violations (1)"));
        assert!(summary.contains("- [policy/high] s3: bucket must be encrypted"));
        assert!(summary.contains("tried adding tags"));
        assert!(!summary.contains("| Branch |"));

        let message = render_commit_message(&inputs).expect("render");
        assert!(message.starts_with("fix(iac): partial remediation, 2 errors remain\n\n"));
        assert!(message.contains("Remaining errors:\n- [syntax] Invalid block (main.tf:3)\n"));
    }
}
