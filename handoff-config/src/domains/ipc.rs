//! IPC channel configuration

use crate::error::ConfigResult;
use crate::validation::{validate_at_most, validate_positive, Validatable};
use serde::{Deserialize, Serialize};

/// Hard ceiling for a single frame; the length field is a `u32`.
pub const FRAME_LEN_LIMIT: usize = u32::MAX as usize;

/// IPC channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Largest payload accepted in a single frame, in bytes
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Number of descriptors a single `recvmsg` call makes room for
    #[serde(default = "default_max_fds_per_message")]
    pub max_fds_per_message: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
            max_fds_per_message: default_max_fds_per_message(),
        }
    }
}

impl Validatable for IpcConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.max_frame_len, "max_frame_len", self.domain_name())?;
        validate_at_most(
            self.max_frame_len,
            FRAME_LEN_LIMIT,
            "max_frame_len",
            self.domain_name(),
        )?;
        validate_positive(
            self.max_fds_per_message,
            "max_fds_per_message",
            self.domain_name(),
        )?;
        // SCM_MAX_FD on Linux
        validate_at_most(self.max_fds_per_message, 253, "max_fds_per_message", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "ipc"
    }
}

fn default_max_frame_len() -> usize {
    16 * 1024 * 1024 // 16MB
}

fn default_max_fds_per_message() -> usize {
    8
}
