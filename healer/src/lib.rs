//! Bounded remediation loop for Terraform configurations checked against OPA
//! policies.
//!
//! Each iteration asks an external remediation capability to fix the known
//! errors, re-validates syntax, re-evaluates policy against a fresh plan,
//! aggregates both into one verdict and decides whether to stop. The loop ends
//! `converged` when syntax is valid with zero violations, or `exhausted` at the
//! iteration ceiling.
//!
//! - **[`core`]**: Pure, deterministic logic (state store, output parsers,
//!   aggregation, loop decision). No I/O.
//! - **[`io`]**: Side-effecting operations (subprocesses, filesystem, git,
//!   config). Isolated behind traits so tests can script them.
//!
//! [`syntax`] and [`policy`] drive the tools, [`stages`] adapts them to the
//! stage interface, [`looping`] runs the bounded loop and [`workflow`] wraps it
//! in the outer pipeline.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod policy;
pub mod report;
pub mod stages;
pub mod syntax;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
