mod cli;
mod commands;

use crate::cli::{Cli, Commands};
use crate::commands::{run_discover, run_fetch, run_list};
use clap::Parser;
use eyre::Result;

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let Cli { command } = Cli::parse();

    match command {
        Commands::Discover(args) => run_discover(&args)?,
        Commands::Fetch(args) => run_fetch(&args)?,
        Commands::List(args) => run_list(&args)?,
    }

    Ok(())
}
