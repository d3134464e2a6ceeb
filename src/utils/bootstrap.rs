//! Bootstrap utilities for the bridge binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the JETSTREAM_BRIDGE_LOG environment variable.
///
/// Defaults to "info" level if JETSTREAM_BRIDGE_LOG is not set. Output goes
/// to stderr so stdout stays free for records.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
