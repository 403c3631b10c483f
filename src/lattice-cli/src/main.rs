//! Lattice CLI entry point.

use anyhow::Result;
use clap::Parser;

use lattice_cli::{Cli, dispatch, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    dispatch(cli).await
}
