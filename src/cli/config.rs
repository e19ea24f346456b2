//! CLI configuration
//!
//! Maps parsed arguments into the engine configuration, with
//! validation.

use std::path::PathBuf;

use anyhow::Result;

use crate::cli::args::CliArgs;
use crate::client::ClientConfig;
use crate::error::TorrentError;
use crate::peer::SessionLimits;

/// Validated configuration for a download run
#[derive(Debug, Clone)]
pub struct Config {
    /// Download directory
    pub output_dir: PathBuf,
    /// Listening port
    pub port: u16,
    /// Maximum number of peer connections
    pub max_connections: usize,
    /// Keep seeding after completion
    pub seed: bool,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Build configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        let output_dir = args.output_dir.clone().unwrap_or_else(|| PathBuf::from("./downloads"));
        Self {
            output_dir,
            port: args.port,
            max_connections: args.max_connections,
            seed: args.seed,
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(TorrentError::config_error_with_field("max_connections must be at least 1", "max_connections").into());
        }
        if self.verbose && self.quiet {
            return Err(TorrentError::config_error("--verbose and --quiet are mutually exclusive").into());
        }
        Ok(())
    }

    /// Engine configuration derived from this CLI configuration
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            download_dir: self.output_dir.clone(),
            port: self.port,
            max_connections: self.max_connections,
            endgame_threshold: 16,
            limits: SessionLimits::default(),
        }
    }
}
