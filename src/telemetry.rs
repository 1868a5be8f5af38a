//! Logging setup
//!
//! Structured logging via tracing. The filter comes from the configured
//! observability level, with the HTTP client/server internals quieted so
//! attempt-level logs stay readable; a RUST_LOG value overrides everything.

use crate::config::ObservabilityConfig;
use tracing_subscriber::EnvFilter;

/// Default filter directives for a configured level
///
/// The crate logs at the configured level; hyper and reqwest internals are
/// held at warn so per-attempt traces are not drowned out.
fn directives(config: &ObservabilityConfig) -> String {
    format!(
        "modelrelay={level},tower_http={level},hyper=warn,reqwest=warn",
        level = config.log_level
    )
}

/// Install the global tracing subscriber
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place. RUST_LOG, when set, wins over the configured level.
pub fn init(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(config)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
