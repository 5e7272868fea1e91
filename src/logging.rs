//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence; otherwise the configured level applies to the
//! whole process. Audit events use the `ssh_gateway::audit` target, so they
//! can be filtered on their own (`RUST_LOG=ssh_gateway::audit=info`).

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
