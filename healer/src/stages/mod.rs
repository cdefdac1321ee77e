//! Concrete loop stages.
//!
//! Each stage wraps one component and declares the state keys it reads and
//! writes. The ordered sequence for one iteration is
//! remediate, syntax fix, syntax check, policy check, aggregate, decide.

pub mod decision;
pub mod remediate;
pub mod verify;

pub use decision::DecisionStage;
pub use remediate::{RemediateStage, SyntaxFixStage};
pub use verify::{AggregatorStage, PolicyEvaluatorStage, SyntaxValidatorStage};
