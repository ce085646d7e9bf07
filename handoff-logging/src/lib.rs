//! Logging infrastructure for handoff
//!
//! All crates emit through `tracing`; this crate only decides how the events
//! are rendered. Binaries call [`init_logging_from_config`] once at startup,
//! tests and small tools can use [`init_simple_tracing`].

pub mod init;

pub use handoff_config::{LogFormat, LogLevel, LoggingConfig};
pub use init::{build_env_filter, init_logging_from_config, init_simple_tracing};
