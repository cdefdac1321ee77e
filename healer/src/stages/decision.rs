//! Loop decision stage.

use anyhow::Result;
use tracing::info;

use crate::core::decision::decide;
use crate::core::stage::{Stage, StageSignal};
use crate::core::state::{StateKey, StateStore};
use crate::core::types::LoopSignal;

/// Escalates when the latest verdict reports a successful build.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionStage;

impl Stage for DecisionStage {
    fn name(&self) -> &'static str {
        "loop_decision"
    }

    fn reads(&self) -> &'static [StateKey] {
        &[StateKey::VerificationResult]
    }

    fn writes(&self) -> &'static [StateKey] {
        &[StateKey::LoopDecision]
    }

    fn run(&self, state: &mut StateStore) -> Result<StageSignal> {
        let signal = decide(state.verification());
        state.record_loop_decision(signal);
        match signal {
            LoopSignal::Exit => {
                info!(attempt = state.attempt(), "build successful, exiting loop");
                Ok(StageSignal::Escalate)
            }
            LoopSignal::Continue => Ok(StageSignal::Continue),
        }
    }
}
