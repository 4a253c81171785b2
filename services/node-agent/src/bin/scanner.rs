//! Scanner stage.
//!
//! Reads `collect-scan`, forwards the images the classifier rejects on
//! `scan-remove`, and exits once the remover reports completion.

use std::process::ExitCode;

use anyhow::Result;
use imgsweep_node_agent::{logging, scanner, Config, PatternClassifier, VERSION};
use tracing::info;

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
        deny_patterns = config.scan_deny.len(),
        delete_scan_failed = config.delete_scan_failed,
        "scanner starting"
    );

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            logging::log_error_chain(&e, "scanner failed");
            ExitCode::from(1)
        }
    }
}

async fn run(config: &Config) -> Result<()> {
    let classifier = PatternClassifier::new(config.scan_deny.iter().cloned());

    let forwarded = scanner::run(config, &classifier).await?;
    info!(forwarded, "scanner finished");
    Ok(())
}
