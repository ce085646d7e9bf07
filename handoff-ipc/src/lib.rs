//! Inter-process channel protocol for handoff
//!
//! An IPC channel is a unix stream socket shared by a parent and a child
//! process. Every write on it becomes one frame: a five byte header (attachment
//! tag and payload length) followed by the payload. A frame that carries a live
//! descriptor has it attached as `SCM_RIGHTS` ancillary data to the first byte
//! the kernel accepts for that frame, so the receiver always holds the
//! descriptor by the time the header is complete.

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{encode_frame, Frame, FrameDecoder, FrameHeader, TransferKind, HEADER_LEN};
pub use transport::{recv_with_fds, send_with_fd};
