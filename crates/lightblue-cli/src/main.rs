//! LightBlue CLI entry point

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use lightblue_ble::BleRadio;
use lightblue_cli::{
    cli::Cli,
    commands::CommandDispatcher,
    config::CliConfig,
    error::Result,
};
use lightblue_core::LightBlue;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose);

    // Load configuration
    let config = load_configuration(&cli)?;

    let radio = match open_radio().await {
        Ok(radio) => radio,
        Err(e) => {
            error!("Failed to open Bluetooth adapter: {}", e);
            std::process::exit(1);
        }
    };

    let lightblue = LightBlue::builder(radio)
        .with_config(config.lightblue.clone())
        .build_and_start()
        .await?;

    // Execute the command
    if let Err(e) = CommandDispatcher::execute(cli, config, lightblue).await {
        error!("Command execution failed: {}", e);
        std::process::exit(1);
    }

    info!("LightBlue CLI exited successfully");
    Ok(())
}

/// Open the default Bluetooth adapter
async fn open_radio() -> Result<Arc<BleRadio>> {
    Ok(Arc::new(BleRadio::new().await?))
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from file or use defaults
fn load_configuration(cli: &Cli) -> Result<CliConfig> {
    if let Some(config_path) = &cli.config {
        info!("Loading configuration from: {}", config_path);
        CliConfig::load_from_file(config_path)
    } else {
        info!("Using default configuration");
        Ok(CliConfig::default())
    }
}
