use anyhow::{Context, Result};
use clap::Parser;
use handoff_config::ConfigLoader;
use handoff_logging::{init_logging_from_config, init_simple_tracing};
use handoff_runtime::{EventLoop, Pipe};
use std::os::fd::AsFd;
use tracing::{debug, info};

mod cli;
mod peer;

use cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load(cli.config.as_ref())
        .context("Failed to load configuration")?;

    match &cli.log_level {
        Some(level) => init_simple_tracing(level)?,
        None => init_logging_from_config(&config.logging)?,
    }

    let event_loop = EventLoop::from_config(&config).context("Failed to create event loop")?;

    // The parent hands us the channel as stdin
    let stdin = std::io::stdin()
        .as_fd()
        .try_clone_to_owned()
        .context("Failed to duplicate stdin")?;
    let channel = Pipe::new(&event_loop, true);
    channel
        .open(stdin)
        .context("stdin is not a socket; run handoff-peer as the child of an IPC channel")?;

    info!(mode = ?cli.mode, pid = std::process::id(), "Peer started");
    peer::run(&cli.mode, &event_loop, &channel)?;
    debug!("Peer finished");
    Ok(())
}
