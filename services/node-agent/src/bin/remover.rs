//! Remover stage.
//!
//! Reads its targets from the scanner or collector pipe (or from
//! `IMGSWEEP_IMAGE_LIST`), removes them against a fresh runtime snapshot and
//! acknowledges every upstream stage.

use std::process::ExitCode;

use anyhow::Result;
use imgsweep_node_agent::{connect_runtime, logging, remover, Config, VERSION};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e:#}");
            return ExitCode::from(1);
        }
    };
    logging::init(&config.log_level);

    info!(
        version = VERSION,
        runtime = %config.runtime.name,
        address = %config.runtime.address,
        scanner_enabled = config.scanner_enabled,
        image_list = ?config.image_list,
        "remover starting"
    );

    match run(&config).await {
        Ok(code) => code,
        Err(e) => {
            logging::log_error_chain(&e, "remover failed");
            ExitCode::from(1)
        }
    }
}

async fn run(config: &Config) -> Result<ExitCode> {
    let runtime = connect_runtime(config).await?;
    let exclusions = config.load_exclusions()?;

    let report = remover::run(config, &runtime, &exclusions).await?;
    info!(removed = report.removed, "remover finished");

    if let Some(err) = &report.first_unexpected_error {
        error!(error = %err, "unexpected error while removing images");
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}
