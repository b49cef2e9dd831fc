use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Field Sync Agent
///
/// Phones home to a management service, applies the settings and commands
/// it sends back, and keeps local directories in sync with an object store.
#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the agent configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the agent in the foreground
    Run,
    /// Phone home and reconcile once, then exit
    CheckNow,
    /// Wake a running agent
    Wake,
    /// Show device state and identity
    Status,
    /// Print the effective configuration
    ShowConfig,
}
