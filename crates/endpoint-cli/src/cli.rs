//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Push messages through a loopback messenger and report their outcomes
    Demo {
        /// Override the messenger queue capacity
        #[arg(long)]
        capacity: Option<usize>,
        /// Number of messages to send
        #[arg(long, default_value_t = 50)]
        messages: usize,
        /// Fail every message after the first K delivered
        #[arg(long)]
        fail_after: Option<usize>,
    },
    /// Print the effective configuration as TOML
    Config,
}
