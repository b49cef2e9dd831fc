use anyhow::Result;
use clap::Parser;

use fieldsync::cli::{Args, Commands};
use fieldsync::commands;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let args = Args::parse();
    let config = args.config;
    let verbose = args.verbose;

    match args.command {
        Commands::Run => commands::run(config, verbose),
        Commands::CheckNow => commands::check_now(config, verbose),
        Commands::Wake => commands::wake(config).map(|_| 0),
        Commands::Status => commands::status(config).map(|_| 0),
        Commands::ShowConfig => commands::show_config(config).map(|_| 0),
    }
}
