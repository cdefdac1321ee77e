//! Stage interface shared by every step of a loop iteration.

use anyhow::Result;

use crate::core::state::{StateKey, StateStore};

/// Control signal returned by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSignal {
    /// Proceed to the next stage.
    Continue,
    /// Stop iterating after this stage, regardless of the remaining budget.
    Escalate,
}

/// One step of the remediation loop.
///
/// A stage reads from and writes to the shared [`StateStore`]. Its declared key
/// sets document the contract; the loop driver warns when a stage writes a key
/// it did not declare.
pub trait Stage {
    fn name(&self) -> &'static str;

    fn reads(&self) -> &'static [StateKey];

    fn writes(&self) -> &'static [StateKey];

    /// Run the stage. An `Err` is recorded as a stage failure and the iteration
    /// continues with the next stage.
    fn run(&self, state: &mut StateStore) -> Result<StageSignal>;
}
