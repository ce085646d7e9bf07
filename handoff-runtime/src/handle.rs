//! Handle abstraction shared by every kind of I/O object

use handoff_ipc::TransferKind;
use std::fmt;

/// Callback run once a close has completed
pub type CloseCallback = Box<dyn FnOnce()>;

/// Kind of a handle, as seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Tcp,
    Udp,
    NamedPipe,
    Process,
    /// A connection whose concrete kind is only known to the application
    Unknown,
}

impl From<TransferKind> for HandleKind {
    fn from(kind: TransferKind) -> Self {
        match kind {
            TransferKind::NamedPipe => HandleKind::NamedPipe,
            TransferKind::Tcp => HandleKind::Tcp,
            TransferKind::Udp => HandleKind::Udp,
            TransferKind::Unknown => HandleKind::Unknown,
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Tcp => write!(f, "tcp"),
            HandleKind::Udp => write!(f, "udp"),
            HandleKind::NamedPipe => write!(f, "named pipe"),
            HandleKind::Process => write!(f, "process"),
            HandleKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Operations common to every handle.
///
/// A handle is owned by the application. The event loop only keeps a weak
/// registration to deliver callbacks, except while a close is in progress.
/// Once closing, every further operation fails with
/// [`RuntimeError::InvalidState`](crate::RuntimeError::InvalidState).
pub trait Handle {
    fn kind(&self) -> HandleKind;

    /// Whether the handle currently keeps the loop alive
    fn is_active(&self) -> bool;

    fn is_closing(&self) -> bool;

    /// Start closing. The optional callback runs on a later loop iteration,
    /// after the descriptor has been released. A second call is ignored.
    fn request_close(&self, callback: Option<CloseCallback>);

    fn close(&self) {
        self.request_close(None)
    }

    fn close_with<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
        Self: Sized,
    {
        self.request_close(Some(Box::new(callback)))
    }
}

/// A handle whose descriptor can travel over an IPC channel, or be the
/// target of an `accept`.
pub trait Transferable: Handle + private::Endpoint {}

pub(crate) mod private {
    use crate::error::RuntimeResult;
    use handoff_ipc::TransferKind;
    use std::os::fd::{BorrowedFd, OwnedFd};

    /// How an adopted descriptor came to be
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Origin {
        /// Accepted from one of our own listening sockets
        Accepted,
        /// Received over an IPC channel, announced with this kind
        Received(TransferKind),
    }

    pub trait Endpoint {
        /// Kind announced on the wire and a duplicate of the descriptor
        fn export(&self) -> RuntimeResult<(TransferKind, OwnedFd)>;

        /// Check that this handle is fresh and can take `fd`, announced as `kind`
        fn check_adopt(&self, kind: TransferKind, fd: BorrowedFd<'_>) -> RuntimeResult<()>;

        /// Take ownership of a descriptor already vetted by `check_adopt`.
        /// On error the descriptor is released and the handle stays fresh.
        fn adopt(&self, fd: OwnedFd, origin: Origin) -> RuntimeResult<()>;
    }
}
