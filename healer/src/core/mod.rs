//! Deterministic, pure logic shared by the remediation loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod decision;
pub mod policy_output;
pub mod stage;
pub mod state;
pub mod syntax_output;
pub mod types;
pub mod verification;
