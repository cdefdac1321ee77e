//! I/O helpers: processes, configuration, git, and run artifacts.

pub mod config;
pub mod files;
pub mod git;
pub mod iteration_log;
pub mod log_sink;
pub mod process;
pub mod remediator;
pub mod tools;
