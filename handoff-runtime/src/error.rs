//! Runtime error types

use handoff_config::ConfigError;
use handoff_ipc::IpcError;
use thiserror::Error;

/// Errors reported by handles, the event loop and the process spawner
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Invalid handle state: {0}")]
    InvalidState(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid handle transfer: {0}")]
    InvalidHandleTransfer(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Failed to spawn process: {0}")]
    SpawnFailure(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

// Convert from nix errno values
impl From<nix::Error> for RuntimeError {
    fn from(err: nix::Error) -> Self {
        Self::Io(std::io::Error::from(err))
    }
}

impl RuntimeError {
    /// Check if this is the orderly end of a stream
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, RuntimeError::EndOfStream)
    }

    /// Check if the handle that reported this error can no longer be read.
    ///
    /// End of stream, transport failures and channel protocol violations all
    /// disarm the read callback; misuse errors leave the handle as it was.
    pub fn is_fatal(&self) -> bool {
        match self {
            RuntimeError::EndOfStream => true,
            RuntimeError::Io(e) => e.kind() != std::io::ErrorKind::WouldBlock,
            RuntimeError::Ipc(e) => !e.is_would_block(),
            _ => false,
        }
    }

    /// Raw OS error code, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            RuntimeError::Io(e) | RuntimeError::SpawnFailure(e) => e.raw_os_error(),
            RuntimeError::Ipc(IpcError::Io(e)) => e.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn closing(what: &str) -> Self {
        RuntimeError::InvalidState(format!("{} on a closing handle", what))
    }
}
