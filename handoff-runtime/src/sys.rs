//! Thin wrappers over the socket calls the handles need

use nix::errno::Errno;
use nix::libc;
use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, Shutdown, SockFlag, SockType, SockaddrIn, SockaddrIn6,
    SockaddrLike, SockaddrStorage, UnixAddr,
};
use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Outcome of a non-blocking connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectStatus {
    Connected,
    InProgress,
}

fn socket_flags() -> SockFlag {
    SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC
}

/// Non-blocking, close-on-exec stream socket
pub(crate) fn stream_socket(family: AddressFamily) -> io::Result<OwnedFd> {
    Ok(socket::socket(family, SockType::Stream, socket_flags(), None)?)
}

pub(crate) fn inet_family(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

fn with_sockaddr<R>(addr: SocketAddr, f: impl FnOnce(&dyn SockaddrLike) -> R) -> R {
    match addr {
        SocketAddr::V4(v4) => f(&SockaddrIn::from(v4)),
        SocketAddr::V6(v6) => f(&SockaddrIn6::from(v6)),
    }
}

pub(crate) fn bind_inet(fd: &OwnedFd, addr: SocketAddr) -> io::Result<()> {
    socket::setsockopt(fd, sockopt::ReuseAddr, &true)?;
    with_sockaddr(addr, |sa| socket::bind(fd.as_raw_fd(), sa))?;
    Ok(())
}

pub(crate) fn bind_unix(fd: &OwnedFd, path: &Path) -> io::Result<()> {
    let addr = UnixAddr::new(path)?;
    socket::bind(fd.as_raw_fd(), &addr)?;
    Ok(())
}

/// `EAGAIN` is a failure: a unix listener with a full backlog, or no free
/// local port for TCP. Only `EINPROGRESS` leaves a connect pending.
fn connect_status(result: nix::Result<()>) -> io::Result<ConnectStatus> {
    match result {
        Ok(()) => Ok(ConnectStatus::Connected),
        Err(Errno::EINPROGRESS) => Ok(ConnectStatus::InProgress),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn connect_inet(fd: &OwnedFd, addr: SocketAddr) -> io::Result<ConnectStatus> {
    connect_status(with_sockaddr(addr, |sa| socket::connect(fd.as_raw_fd(), sa)))
}

pub(crate) fn connect_unix(fd: &OwnedFd, path: &Path) -> io::Result<ConnectStatus> {
    let addr = UnixAddr::new(path)?;
    connect_status(socket::connect(fd.as_raw_fd(), &addr))
}

pub(crate) fn listen(fd: &OwnedFd, backlog: i32) -> io::Result<()> {
    let backlog = Backlog::new(backlog)?;
    socket::listen(fd, backlog)?;
    Ok(())
}

/// Accept one connection; `WouldBlock` once the queue is drained
pub(crate) fn accept(fd: &OwnedFd) -> io::Result<OwnedFd> {
    loop {
        match socket::accept4(fd.as_raw_fd(), socket_flags()) {
            // SAFETY: accept4 returned a fresh descriptor that nothing else owns
            Ok(raw) => return Ok(unsafe { OwnedFd::from_raw_fd(raw) }),
            Err(Errno::EINTR) | Err(Errno::ECONNABORTED) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Pending error on the socket, cleared by reading it
pub(crate) fn take_error(fd: &OwnedFd) -> io::Result<Option<io::Error>> {
    let code = socket::getsockopt(fd, sockopt::SocketError)?;
    if code == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(code)))
    }
}

pub(crate) fn is_listening(fd: &OwnedFd) -> bool {
    socket::getsockopt(fd, sockopt::AcceptConn).unwrap_or(false)
}

/// Address family reported by `getsockname`/`getpeername`, read straight from
/// the raw storage. Unnamed unix addresses (socket pairs) carry nothing but
/// the family field.
fn raw_family(fd: RawFd, peer: bool) -> Option<AddressFamily> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: `storage` is a writable buffer of `len` bytes
    let rc = unsafe {
        if peer {
            libc::getpeername(fd, storage.as_mut_ptr().cast(), &mut len)
        } else {
            libc::getsockname(fd, storage.as_mut_ptr().cast(), &mut len)
        }
    };
    if rc != 0 {
        return None;
    }
    // SAFETY: zero-initialised and filled in by the kernel
    let storage = unsafe { storage.assume_init() };
    AddressFamily::from_i32(i32::from(storage.ss_family))
}

pub(crate) fn has_peer(fd: &OwnedFd) -> bool {
    raw_family(fd.as_raw_fd(), true).is_some()
}

/// `None` when `fd` is not a socket
pub(crate) fn family(fd: BorrowedFd<'_>) -> Option<AddressFamily> {
    raw_family(fd.as_raw_fd(), false)
}

fn to_socket_addr(addr: SockaddrStorage) -> io::Result<SocketAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Ok(SocketAddr::V4(SocketAddrV4::from(*v4)));
    }
    if let Some(v6) = addr.as_sockaddr_in6() {
        return Ok(SocketAddr::V6(SocketAddrV6::from(*v6)));
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "socket is not an internet socket",
    ))
}

pub(crate) fn local_addr(fd: &OwnedFd) -> io::Result<SocketAddr> {
    to_socket_addr(socket::getsockname::<SockaddrStorage>(fd.as_raw_fd())?)
}

pub(crate) fn peer_addr(fd: &OwnedFd) -> io::Result<SocketAddr> {
    to_socket_addr(socket::getpeername::<SockaddrStorage>(fd.as_raw_fd())?)
}

pub(crate) fn set_nodelay(fd: &OwnedFd, enable: bool) -> io::Result<()> {
    socket::setsockopt(fd, sockopt::TcpNoDelay, &enable)?;
    Ok(())
}

pub(crate) fn shutdown_write(fd: &OwnedFd) -> io::Result<()> {
    socket::shutdown(fd.as_raw_fd(), Shutdown::Write)?;
    Ok(())
}

/// Put an adopted descriptor into non-blocking mode.
///
/// `UnixStream::set_nonblocking` only flips `O_NONBLOCK` on the open file
/// description, so it is valid for any socket type.
pub(crate) fn set_nonblocking(fd: OwnedFd) -> io::Result<OwnedFd> {
    let socket = UnixStream::from(fd);
    socket.set_nonblocking(true)?;
    Ok(OwnedFd::from(socket))
}
