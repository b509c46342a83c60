//! `tracing` subscriber bootstrap.
//!
//! Library code only emits events; binaries call [`init`] once at startup.

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (usually `VmConfig::log_filter`).
///
/// Returns `false` if a global subscriber was already installed, so calling
/// this twice is harmless.
pub fn init(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}
