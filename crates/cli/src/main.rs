//! htvend binary: record the HTTP(S) assets a build fetches, then replay
//! them with network egress forbidden.

mod commands;
mod listener;
mod options;
mod signals;
mod subprocess;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Hermetic HTTP(S) vendoring proxy.
#[derive(Parser, Debug)]
#[command(name = "htvend")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command under the proxy to create/update the manifest file
    Build(commands::build::BuildArgs),
    /// Verify manifest assets, optionally fetching missing or rotten ones
    Verify(commands::verify::VerifyArgs),
    /// Run a command against recorded assets only, with egress forbidden
    Offline(commands::offline::OfflineArgs),
    /// Copy referenced blobs into another blob store directory
    Export(commands::export::ExportArgs),
    /// Remove unreferenced blobs from the shared global cache
    Clean(commands::clean::CleanArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Command::Build(args) => commands::build::run(args).await,
        Command::Verify(args) => commands::verify::run(args).await,
        Command::Offline(args) => commands::offline::run(args).await,
        Command::Export(args) => commands::export::run(args).await,
        Command::Clean(args) => commands::clean::run(args).await,
    }
}
