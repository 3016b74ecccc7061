//! Command-line interface.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "docrelay",
    version,
    about = "Streaming raw-document ingestion worker"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingestion worker against a spool topic
    Run(commands::RunArgs),
    /// Append documents to a spool topic for the worker to consume
    Seed(commands::SeedArgs),
}

/// Parse arguments and dispatch to the selected command.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => commands::run(args).await,
        Command::Seed(args) => commands::seed(args).await,
    }
}
