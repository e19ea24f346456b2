//! swarmdl - Main entry point
//!
//! Loads a torrent file, runs the download engine, and renders progress
//! until completion or interrupt.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use swarmdl::{CliArgs, Config, ConnectionManager, MetainfoParser, ProgressDisplay, TorrentStatus};

/// Log unexpected panics with a backtrace before the process dies
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            error!("PANIC at {}:{}:{}", location.file(), location.line(), location.column());
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

fn init_logging(config: &Config) {
    let default_level = if config.quiet {
        "error"
    } else if config.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    let config = Config::from_args(&args);
    config.validate()?;
    init_logging(&config);

    let metadata = Arc::new(MetainfoParser::parse_file(&args.torrent_file).context("Failed to load torrent file")?);
    info!(
        "Loaded '{}': {} pieces, {} bytes, announce {}",
        metadata.name,
        metadata.piece_count(),
        metadata.total_length,
        metadata.announce
    );

    let mut manager = ConnectionManager::new(metadata, config.client_config());
    manager.start().await.context("Failed to start torrent")?;

    let mut progress = ProgressDisplay::new();
    let outcome = run_until_done(&mut manager, &config, &mut progress).await;
    progress.finish();
    manager.stop().await;
    outcome
}

async fn run_until_done(manager: &mut ConnectionManager, config: &Config, progress: &mut ProgressDisplay) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                let state = manager.state().await;
                if !config.quiet {
                    progress.render(&state);
                }
                match state.status {
                    TorrentStatus::Seeding if !config.seed => {
                        info!("Download complete");
                        return Ok(());
                    }
                    TorrentStatus::Failed { reason } => {
                        error!("Torrent failed: {}", reason);
                        anyhow::bail!("torrent failed: {}", reason);
                    }
                    TorrentStatus::Stopped => return Ok(()),
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; shutting down");
                return Ok(());
            }
        }
    }
}
