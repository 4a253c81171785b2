//! Logging setup shared by the stage binaries.
//!
//! JSON lines on stdout so the node's log collector can index stage output.

use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
pub fn init(default_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Log a fatal error followed by each of its causes.
pub fn log_error_chain(err: &anyhow::Error, message: &str) {
    error!(error = %err, "{message}");
    for cause in err.chain().skip(1) {
        error!(cause = %cause, "caused by");
    }
}
