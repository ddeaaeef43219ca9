use anyhow::Result;
use clap::{Parser, Subcommand};

use ga_annotate::{resolution, serve};

#[derive(Parser)]
#[command(name = "ga-annotate", about = "Browse scan volumes and record line annotations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the annotation web server
    Serve(serve::ServeArgs),

    /// Append resolution, height and width columns to a dataset CSV
    AddResolution(resolution::ResolutionArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    match cli.command {
        Command::Serve(args) => serve::run(args),
        Command::AddResolution(args) => resolution::run(args),
    }
}
