//! Collector stage.
//!
//! Lists the node's images, drops everything running or excluded, publishes
//! the rest on `collect-scan` and exits once the remover reports completion.

use std::process::ExitCode;

use anyhow::Result;
use imgsweep_node_agent::{collector, connect_runtime, logging, Config, VERSION};
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
        runtime = %config.runtime.name,
        address = %config.runtime.address,
        shared_dir = %config.shared_dir.display(),
        "collector starting"
    );

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            logging::log_error_chain(&e, "collector failed");
            ExitCode::from(1)
        }
    }
}

async fn run(config: &Config) -> Result<()> {
    let runtime = connect_runtime(config).await?;
    let exclusions = config.load_exclusions()?;

    let published = collector::run(config, &runtime, &exclusions).await?;
    info!(published, "collector finished");
    Ok(())
}
