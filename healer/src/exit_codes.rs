//! Stable exit codes for healer CLI commands.

/// The loop converged, or the command succeeded.
pub const OK: i32 = 0;
/// Fatal error: invalid config, missing working copy or policy, I/O failure.
pub const FATAL: i32 = 1;
/// The loop hit its ceiling, or `verify` found remaining errors.
pub const EXHAUSTED: i32 = 2;
