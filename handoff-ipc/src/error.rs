//! IPC error types

use crate::protocol::TransferKind;
use thiserror::Error;

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Frame payload exceeds the configured limit
    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// Header carries a tag this side does not understand
    #[error("Unknown frame tag: {0}")]
    UnknownTag(u8),

    /// Header announced a handle but no descriptor was received for it
    #[error("Frame declares a {0} handle but no descriptor arrived with it")]
    MissingDescriptor(TransferKind),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IpcError {
    /// Check if this error leaves the byte stream out of sync.
    ///
    /// After a fatal error the receiver cannot find the next frame boundary
    /// and must stop reading from the channel.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::FrameTooLarge { .. } | IpcError::UnknownTag(_) | IpcError::MissingDescriptor(_)
        )
    }

    /// Check if this error only means "try again when ready"
    pub fn is_would_block(&self) -> bool {
        matches!(self, IpcError::Io(e) if e.kind() == std::io::ErrorKind::WouldBlock)
    }
}

impl From<nix::Error> for IpcError {
    fn from(err: nix::Error) -> Self {
        IpcError::Io(std::io::Error::from(err))
    }
}
