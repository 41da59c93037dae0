//! Diagnostic tracing for catguard.
//!
//! Hooks parse stdout as JSON, so every log line is written to stderr.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// The filter comes from `RUST_LOG` and falls back to `warn`, which keeps
/// hook output quiet apart from blocked commands and failed cleanups:
///
/// ```bash
/// RUST_LOG=catguard::guard=debug catguard check-bash --command 'rm -rf build'
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .init();
}
