//! Diagnostic tracing for the healer binary.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. Run artifacts
//! (`build.log`, per-iteration JSON, `summary.md`) are written regardless of
//! the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=healer=debug healer run --working-copy infra --policy policy
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
