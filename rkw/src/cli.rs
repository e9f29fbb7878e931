use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rkw", version, about = "RKW workbench daemon CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the workbench daemon with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate a config file and the tool catalog it points to
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
}
