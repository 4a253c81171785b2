//! imgsweep node agent
//!
//! Finds container images on a node that no container uses and removes
//! them. The work is split across three short-lived processes that share a
//! directory of named pipes:
//!
//! ```text
//! collector ──collect-scan──▶ scanner ──scan-remove──▶ remover
//!     ▲                          ▲                        │
//!     └──remove-complete-collect─┴──remove-complete-scan──┘
//! ```
//!
//! With scanning disabled the remover reads `collect-scan` directly and only
//! acknowledges the collector.
//!
//! ## Modules
//!
//! - `grpc_client`: CRI client with v1 / v1alpha2 negotiation
//! - `runtime`: the runtime contract and an in-memory mock
//! - `remover`: removal and prune engine
//! - `handoff`: FIFO data and completion pipes
//! - `collector`, `scanner`: the upstream stages

pub mod collector;
pub mod config;
pub mod endpoint;
pub mod grpc_client;
pub mod handoff;
pub mod logging;
pub mod remover;
pub mod runtime;
pub mod scanner;

pub use config::{Config, RuntimeName, RuntimeSpec};
pub use grpc_client::{ApiVersion, CriClient};
pub use remover::{ImageOutcome, Outcome, PruneSummary, RemovalReport};
pub use runtime::{ImageRuntime, MockRuntime, RuntimeError};
pub use scanner::{Classifier, PatternClassifier, ScanOutcome};

/// Agent version (semver).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Connect to the configured runtime.
pub async fn connect_runtime(config: &Config) -> anyhow::Result<CriClient> {
    use anyhow::Context;

    let endpoint = config
        .runtime
        .endpoint_with_fallback(&config.runtime_fallback_scheme)
        .context("invalid runtime address")?;
    CriClient::connect(&endpoint, config.runtime_timeout)
        .await
        .with_context(|| format!("failed to get image client for {}", config.runtime.name))
}
