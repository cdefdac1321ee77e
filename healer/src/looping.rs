//! Bounded remediation loop driver.
//!
//! The driver owns the authoritative attempt counter: it runs at most
//! `ceiling` passes over the stage sequence and stops early only when a stage
//! escalates. The aggregator's `iteration_count` is reported alongside but
//! never consulted for termination.

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::stage::{Stage, StageSignal};
use crate::core::state::{StageFailure, StateStore};
use crate::core::verification::VerificationResult;

/// Terminal state of a loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopTerminal {
    /// The loop decision observed a successful build.
    Converged,
    /// The ceiling was reached without a successful build.
    Exhausted,
}

impl LoopTerminal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::Exhausted => "exhausted",
        }
    }
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub terminal: LoopTerminal,
    /// Loop-driver attempts executed.
    pub iterations: u32,
    /// Verification passes completed (the aggregator's counter).
    pub verification_passes: u32,
    pub verification: Option<VerificationResult>,
}

/// Run the stage sequence until a stage escalates or `ceiling` attempts ran.
///
/// `on_iteration` is called after every attempt, including the last.
/// Stage errors never abort the loop; they are recorded in the state store.
#[instrument(skip_all, fields(ceiling, stages = stages.len()))]
pub fn run_loop<F: FnMut(u32, &StateStore)>(
    state: &mut StateStore,
    stages: &[&dyn Stage],
    ceiling: u32,
    mut on_iteration: F,
) -> Result<LoopOutcome> {
    if ceiling == 0 {
        return Err(anyhow!("iteration ceiling must be > 0"));
    }

    let mut terminal = LoopTerminal::Exhausted;
    let mut iterations = 0u32;
    for attempt in 1..=ceiling {
        iterations = attempt;
        info!(attempt, ceiling, "starting iteration");
        let signal = run_pass(state, stages, attempt);
        on_iteration(attempt, state);
        if signal == StageSignal::Escalate {
            terminal = LoopTerminal::Converged;
            break;
        }
    }

    let outcome = LoopOutcome {
        terminal,
        iterations,
        verification_passes: state.iteration_count(),
        verification: state.verification().cloned(),
    };
    info!(
        terminal = outcome.terminal.as_str(),
        iterations = outcome.iterations,
        verification_passes = outcome.verification_passes,
        "loop finished"
    );
    Ok(outcome)
}

/// Run every stage once, in order, stopping early on escalation.
pub fn run_pass(state: &mut StateStore, stages: &[&dyn Stage], attempt: u32) -> StageSignal {
    state.begin_attempt(attempt);
    for stage in stages {
        if run_stage(state, *stage, attempt) == StageSignal::Escalate {
            return StageSignal::Escalate;
        }
    }
    StageSignal::Continue
}

fn run_stage(state: &mut StateStore, stage: &dyn Stage, attempt: u32) -> StageSignal {
    let name = stage.name();
    debug!(stage = name, reads = ?stage.reads(), "running stage");
    state.take_touched();
    let result = stage.run(state);

    for key in state.take_touched() {
        if !stage.writes().contains(&key) {
            warn!(stage = name, key = key.as_str(), "stage wrote an undeclared key");
        }
    }

    match result {
        Ok(signal) => signal,
        Err(err) => {
            let message = format!("{err:#}");
            warn!(stage = name, attempt, err = %message, "stage failed, continuing");
            state.record_stage_failure(StageFailure {
                stage: name.to_string(),
                attempt,
                message,
            });
            state.take_touched();
            StageSignal::Continue
        }
    }
}
