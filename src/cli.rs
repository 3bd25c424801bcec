use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "chatpresence", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, value_name = "FILE")]
    pub config_path: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Flap a user's connection and report the durable status
    Simulate {
        /// User ID
        #[arg(short, long, default_value = "demo")]
        user: String,

        /// Number of connectivity toggles, starting with a connect
        #[arg(short, long, default_value_t = 3)]
        flaps: u32,
    },

    /// Load one document through the cache from many callers at once
    Fetch {
        /// Document path, e.g. users/42
        path: String,

        /// Concurrent loads
        #[arg(short = 'n', long, default_value_t = 8)]
        concurrency: usize,
    },

    /// Generate sample configuration
    ConfigSample {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
