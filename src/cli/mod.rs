//! CLI module for Harbor
//!
//! Provides commands:
//! - `serve`: run the HTTP server (default)
//! - `doctor`: check configuration and the instance binary

use clap::{Parser, Subcommand};

pub mod doctor;

/// Harbor workspace orchestrator CLI
#[derive(Parser, Debug)]
#[command(name = "harbor")]
#[command(about = "Runs one instance per workspace behind a single HTTP endpoint")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the server (default)
    Serve,
    /// Run configuration diagnostics
    Doctor,
}

/// Run the CLI command
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Doctor) => doctor::run().await,
        Some(Commands::Serve) | None => crate::server::run().await,
    }
}
