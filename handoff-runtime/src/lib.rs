//! Single-threaded event loop with IPC handle passing
//!
//! Handles ([`Pipe`], [`Tcp`], [`Udp`], [`Process`]) are created on an
//! [`EventLoop`] and report progress through callbacks that run on the loop
//! thread, one at a time. A [`Pipe`] created with `ipc = true` is an IPC
//! channel: besides bytes it can carry live handles between processes.
//!
//! ```no_run
//! use handoff_runtime::{EventLoop, Handle, Pipe};
//! use std::os::fd::AsFd;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let event_loop = EventLoop::new()?;
//! let channel = Pipe::new(&event_loop, true);
//! channel.open(std::io::stdin().as_fd().try_clone_to_owned()?)?;
//! channel.start_read(|stream, frame| match frame {
//!     Ok(payload) => println!("{} bytes, handle: {:?}", payload.len(), stream.pending_handle_type()),
//!     Err(_) => stream.close(),
//! })?;
//! event_loop.run()?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod event_loop;
pub mod handle;
pub mod pipe;
pub mod process;
pub mod stream;
mod sys;
pub mod tcp;
pub mod udp;

// Re-export commonly used types
pub use error::{RuntimeError, RuntimeResult};
pub use event_loop::EventLoop;
pub use handle::{CloseCallback, Handle, HandleKind, Transferable};
pub use pipe::Pipe;
pub use process::{ExitCallback, PipeFlags, Process, ProcessOptions, StdioContainer};
pub use stream::{Stream, StreamRole};
pub use tcp::Tcp;
pub use udp::Udp;

// Configuration types callers need to build a loop
pub use handoff_config::{EventLoopConfig, HandoffConfig, IpcConfig};
