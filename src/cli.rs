//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Switchboard dispatch service CLI
#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "Dispatch engine for a multi-agent orchestration service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP dispatch service
    Serve {
        /// Override the agent manifest path from configuration
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
}
