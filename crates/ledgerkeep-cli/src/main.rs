mod cli;
mod commands;

use std::io;

use clap::Parser;
use ledgerkeep_core::{Ledgerkeep, LoadOptions};

use crate::cli::Cli;

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let lk = Ledgerkeep::load_with_options(LoadOptions {
        home: cli.home.clone(),
    })?;
    log::debug!("home: {}", lk.home().display());

    if !commands::execute(&cli.command, &lk).await? {
        std::process::exit(1);
    }
    Ok(())
}
