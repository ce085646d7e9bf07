//! Descriptor passing over unix stream sockets

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use tracing::trace;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_flags() -> MsgFlags {
    MsgFlags::MSG_NOSIGNAL | MsgFlags::MSG_DONTWAIT
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_flags() -> MsgFlags {
    MsgFlags::MSG_DONTWAIT
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC | MsgFlags::MSG_DONTWAIT
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_DONTWAIT
}

/// Write `data` to `socket`, attaching `attachment` as `SCM_RIGHTS`.
///
/// Returns the number of bytes the kernel accepted. When the result is
/// non-zero and a descriptor was attached, the kernel holds its own reference
/// to it and the caller must not attach it again for the rest of the frame.
pub fn send_with_fd(
    socket: BorrowedFd<'_>,
    data: &[u8],
    attachment: Option<BorrowedFd<'_>>,
) -> io::Result<usize> {
    let iov = [IoSlice::new(data)];
    let fds: Vec<RawFd> = attachment.iter().map(|fd| fd.as_raw_fd()).collect();
    let rights = [ControlMessage::ScmRights(&fds)];
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };

    loop {
        match sendmsg::<()>(socket.as_raw_fd(), &iov, cmsgs, send_flags(), None) {
            Ok(n) => {
                trace!(
                    fd = socket.as_raw_fd(),
                    bytes = n,
                    with_descriptor = !fds.is_empty(),
                    "sendmsg"
                );
                return Ok(n);
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
}

/// Read from `socket` into `buf`, queueing any received descriptors in `fds`.
///
/// Returns the number of payload bytes read; 0 means the peer closed the
/// connection. Descriptors are owned by the caller once queued.
pub fn recv_with_fds(
    socket: BorrowedFd<'_>,
    buf: &mut [u8],
    fds: &mut VecDeque<OwnedFd>,
    max_fds: usize,
) -> io::Result<usize> {
    // Room for `max_fds` descriptors; zero means "plain read, no ancillary data"
    let per_fd = nix::cmsg_space!(RawFd).capacity();
    let mut control = vec![0u8; per_fd * max_fds];

    loop {
        let mut iov = [IoSliceMut::new(buf)];
        let cmsg_buffer = if max_fds == 0 {
            None
        } else {
            Some(&mut control[..])
        };
        let msg = match recvmsg::<()>(socket.as_raw_fd(), &mut iov, cmsg_buffer, recv_flags()) {
            Ok(msg) => msg,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        };

        let bytes = msg.bytes;
        let mut received = 0usize;
        for cmsg in msg.cmsgs().map_err(io::Error::from)? {
            if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                for raw in raw_fds {
                    // SAFETY: the kernel just installed this descriptor in our
                    // table for us; nothing else refers to it yet.
                    fds.push_back(unsafe { OwnedFd::from_raw_fd(raw) });
                    received += 1;
                }
            }
        }

        trace!(
            fd = socket.as_raw_fd(),
            bytes,
            descriptors = received,
            "recvmsg"
        );
        return Ok(bytes);
    }
}
