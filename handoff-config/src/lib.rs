//! Domain-driven configuration for the handoff runtime
//!
//! Configuration is split by functional domain (event loop, IPC channel,
//! logging), each with its own defaults and validation. Values can be loaded
//! from YAML and overridden through `HANDOFF_*` environment variables.

pub mod domains;
pub mod error;
pub mod loader;
pub mod validation;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    event_loop::EventLoopConfig,
    ipc::IpcConfig,
    logging::{LogFormat, LogLevel, LoggingConfig},
    HandoffConfig,
};
