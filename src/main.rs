//! Main entry point for the switchboard dispatch service.

use anyhow::Result;
use clap::Parser;
use switchboard::{cli, server, settings::Settings, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings
    let mut settings = Settings::load()?;

    // Initialize logging
    telemetry::init(&settings.logging)?;

    // Execute the requested command
    match args.command {
        cli::Commands::Serve { manifest } => {
            if let Some(path) = manifest {
                settings.registry.manifest_path = path;
            }
            server::serve(settings).await
        }
    }
}
