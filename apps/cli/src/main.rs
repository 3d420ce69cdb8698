//! hackcrawl CLI: incremental hackathon and project crawler.
//!
//! Pages through the hackathon listing, fetches hackathon and project
//! details, and keeps a local libSQL store in sync across interrupted runs.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
