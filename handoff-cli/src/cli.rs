//! CLI argument parsing definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Child side of an IPC channel. The channel is expected on stdin.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Listen on a TCP server, then send it to the parent
    ListenBeforeWrite {
        /// Port to bind on 127.0.0.1 (0 picks a free one)
        #[arg(long, default_value = "0")]
        port: u16,
    },

    /// Send a TCP server to the parent, then listen on it
    ListenAfterWrite {
        /// Port to bind on 127.0.0.1 (0 picks a free one)
        #[arg(long, default_value = "0")]
        port: u16,
    },

    /// Send every received handle straight back
    Echo,

    /// Answer "hello" with "world"
    Hello,
}
