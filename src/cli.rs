use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

/// The command line interface for the KORUZA control daemon.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Run as the broker daemon. Without this flag the binary would act
    /// as the interactive controller, which this build does not include.
    #[arg(short = 'd')]
    pub daemon: bool,

    /// Also log to standard error in addition to the log files.
    #[arg(short = 'f')]
    pub foreground: bool,

    /// Subcommands.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Show an example of a configuration file's contents.
    ConfigExample,
}

/// Act on a subcommand.
pub fn handle_command(command: Commands) {
    match command {
        Commands::ConfigExample => println!("{}", Config::example().serialize_pretty()),
    }
}
