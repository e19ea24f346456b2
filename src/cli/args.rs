//! CLI arguments
//!
//! Command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the downloader
#[derive(Debug, Parser)]
#[command(name = "swarmdl")]
#[command(about = "A BitTorrent downloader", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Download directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Listening port for incoming connections
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Maximum number of peer connections
    #[arg(short, long, default_value_t = 50)]
    pub max_connections: usize,

    /// Keep seeding after the download completes
    #[arg(long, default_value_t = false)]
    pub seed: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse arguments from the process environment
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
