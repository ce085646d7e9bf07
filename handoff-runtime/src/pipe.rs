//! Unix domain socket streams, including IPC channels

use std::os::fd::OwnedFd;
use std::path::Path;

use nix::sys::socket::AddressFamily;

use crate::error::RuntimeResult;
use crate::event_loop::EventLoop;
use crate::stream::{delegate_stream_handle, Stream, StreamKind};
use crate::sys;

/// A named pipe (unix stream socket).
///
/// Created with `ipc = true` it becomes an IPC channel: writes are framed and
/// may carry a handle, reads deliver whole frames.
#[derive(Clone, Debug)]
pub struct Pipe {
    stream: Stream,
}

impl Pipe {
    pub fn new(event_loop: &EventLoop, ipc: bool) -> Self {
        Self {
            stream: Stream::new(event_loop, StreamKind::Pipe, ipc),
        }
    }

    /// Adopt an existing socket, such as the IPC slot a child inherited
    pub fn open(&self, fd: OwnedFd) -> RuntimeResult<()> {
        self.stream.open_fd(fd)
    }

    /// Bind to a filesystem path; the socket file is removed on close
    pub fn bind(&self, path: impl AsRef<Path>) -> RuntimeResult<()> {
        let path = path.as_ref();
        let fd = sys::stream_socket(AddressFamily::Unix)?;
        sys::bind_unix(&fd, path)?;
        self.stream.install_bound(fd, Some(path.to_path_buf()))
    }

    pub fn connect<F>(&self, path: impl AsRef<Path>, callback: F) -> RuntimeResult<()>
    where
        F: FnOnce(&Stream, RuntimeResult<()>) + 'static,
    {
        let path = path.as_ref();
        self.stream.start_connect(
            || sys::stream_socket(AddressFamily::Unix),
            |fd| sys::connect_unix(fd, path),
            Box::new(callback),
        )
    }

    pub fn is_ipc(&self) -> bool {
        self.stream.is_ipc_channel()
    }
}

delegate_stream_handle!(Pipe);
