// Wrench maintenance-data assistant
// Main entry point for the wrench binary

use clap::Parser;
use wrench_engine::cli::{Cli, Command};
use wrench_engine::config::Config;
use wrench_engine::handlers::{handle_ask, handle_doctor, handle_serve, OutputFormat};
use wrench_engine::telemetry::{init_telemetry, init_telemetry_with_level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let loaded = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)
    } else {
        Config::load_or_create()
    };
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            init_telemetry();
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // --log wins over the config file; RUST_LOG wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);
    tracing::info!("Wrench v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Serve { bind } => {
            tracing::info!("Starting server...");
            handle_serve(&config, bind).await
        }

        Command::Ask { message, session } => handle_ask(message, session, &config, format).await,

        Command::Doctor => {
            tracing::info!("Running diagnostics...");
            handle_doctor(&config, format).await
        }
    }
}
