//! UDP datagram sockets

use bytes::Bytes;
use handoff_ipc::TransferKind;
use nix::poll::PollFlags;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use tracing::{debug, trace, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::event_loop::{EventLoop, LoopRef, Source};
use crate::handle::private::{Endpoint, Origin};
use crate::handle::{CloseCallback, Handle, HandleKind, Transferable};

pub type RecvCallback = Box<dyn FnMut(&Udp, RuntimeResult<(Bytes, SocketAddr)>)>;
pub type SendCallback = Box<dyn FnOnce(&Udp, RuntimeResult<()>)>;

/// Datagrams handed out per readiness notification
const MAX_RECVS_PER_TICK: usize = 32;

struct SendRequest {
    data: Bytes,
    addr: SocketAddr,
    callback: Option<SendCallback>,
}

struct UdpState {
    socket: Option<UdpSocket>,
    closing: bool,
    close_callback: Option<CloseCallback>,
    receiving: bool,
    recv_callback: Option<RecvCallback>,
    sends: VecDeque<SendRequest>,
}

pub(crate) struct UdpCore {
    id: u64,
    event_loop: LoopRef,
    state: RefCell<UdpState>,
}

/// A UDP socket
#[derive(Clone)]
pub struct Udp {
    core: Rc<UdpCore>,
}

impl Udp {
    pub fn new(event_loop: &EventLoop) -> Self {
        let id = event_loop.allocate_id();
        let core = Rc::new(UdpCore {
            id,
            event_loop: event_loop.downgrade(),
            state: RefCell::new(UdpState {
                socket: None,
                closing: false,
                close_callback: None,
                receiving: false,
                recv_callback: None,
                sends: VecDeque::new(),
            }),
        });
        let source: Weak<dyn Source> = Rc::downgrade(&core) as Weak<dyn Source>;
        event_loop.register(id, source);
        Self { core }
    }

    pub fn bind(&self, addr: SocketAddr) -> RuntimeResult<()> {
        {
            let st = self.core.state.borrow();
            if st.closing {
                return Err(RuntimeError::closing("bind"));
            }
            if st.socket.is_some() {
                return Err(RuntimeError::InvalidState(
                    "socket is already bound".to_string(),
                ));
            }
        }
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        debug!(id = self.core.id, addr = %socket.local_addr()?, "Bound UDP socket");
        self.core.state.borrow_mut().socket = Some(socket);
        Ok(())
    }

    /// Send one datagram. An unbound socket is bound to the wildcard address
    /// of `addr`'s family first.
    pub fn send<F>(&self, addr: SocketAddr, data: &[u8], callback: F) -> RuntimeResult<()>
    where
        F: FnOnce(&Udp, RuntimeResult<()>) + 'static,
    {
        let needs_bind = {
            let st = self.core.state.borrow();
            if st.closing {
                return Err(RuntimeError::closing("send"));
            }
            st.socket.is_none()
        };
        if needs_bind {
            let any = match addr {
                SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
                SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
            };
            self.bind(any)?;
        }

        let first = {
            let mut st = self.core.state.borrow_mut();
            st.sends.push_back(SendRequest {
                data: Bytes::copy_from_slice(data),
                addr,
                callback: Some(Box::new(callback)),
            });
            st.sends.len() == 1
        };
        if first {
            self.core.flush_sends();
        }
        Ok(())
    }

    pub fn start_recv<F>(&self, callback: F) -> RuntimeResult<()>
    where
        F: FnMut(&Udp, RuntimeResult<(Bytes, SocketAddr)>) + 'static,
    {
        let mut st = self.core.state.borrow_mut();
        if st.closing {
            return Err(RuntimeError::closing("recv"));
        }
        if st.socket.is_none() {
            return Err(RuntimeError::InvalidState(
                "socket is not bound".to_string(),
            ));
        }
        if st.receiving {
            return Err(RuntimeError::InvalidState(
                "socket is already receiving".to_string(),
            ));
        }
        st.receiving = true;
        st.recv_callback = Some(Box::new(callback));
        Ok(())
    }

    pub fn stop_recv(&self) -> RuntimeResult<()> {
        let callback = {
            let mut st = self.core.state.borrow_mut();
            if st.closing {
                return Err(RuntimeError::closing("stop_recv"));
            }
            st.receiving = false;
            st.recv_callback.take()
        };
        drop(callback);
        Ok(())
    }

    pub fn getsockname(&self) -> RuntimeResult<SocketAddr> {
        let st = self.core.state.borrow();
        if st.closing {
            return Err(RuntimeError::closing("getsockname"));
        }
        match st.socket.as_ref() {
            Some(socket) => Ok(socket.local_addr()?),
            None => Err(RuntimeError::InvalidState(
                "socket is not bound".to_string(),
            )),
        }
    }
}

impl UdpCore {
    fn defer_callback(self: &Rc<Self>, f: impl FnOnce(&Udp) + 'static) {
        let Ok(event_loop) = self.event_loop.upgrade() else {
            return;
        };
        let core = self.clone();
        event_loop.defer(move || {
            if core.state.borrow().closing {
                return;
            }
            f(&Udp { core });
        });
    }

    fn flush_sends(self: &Rc<Self>) {
        let mut completed = Vec::new();
        {
            let mut st = self.state.borrow_mut();
            let UdpState { socket, sends, .. } = &mut *st;
            let Some(socket) = socket.as_ref() else {
                return;
            };
            while let Some(req) = sends.front() {
                let outcome = match socket.send_to(&req.data, req.addr) {
                    Ok(_) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => Err(RuntimeError::from(e)),
                };
                if let Some(req) = sends.pop_front() {
                    trace!(id = self.id, bytes = req.data.len(), to = %req.addr, "Datagram sent");
                    completed.push((req.callback, outcome));
                }
            }
        }
        for (callback, result) in completed {
            if let Some(callback) = callback {
                self.defer_callback(move |udp| callback(udp, result));
            }
        }
    }

    fn deliver(self: &Rc<Self>, result: RuntimeResult<(Bytes, SocketAddr)>) {
        let callback = self.state.borrow_mut().recv_callback.take();
        let Some(mut callback) = callback else {
            return;
        };
        callback(&Udp { core: self.clone() }, result);
        let mut st = self.state.borrow_mut();
        if st.receiving && !st.closing && st.recv_callback.is_none() {
            st.recv_callback = Some(callback);
        }
    }

    fn recv_ready(self: &Rc<Self>, event_loop: &EventLoop) {
        for _ in 0..MAX_RECVS_PER_TICK {
            let result = {
                let st = self.state.borrow();
                if !st.receiving || st.closing {
                    return;
                }
                let Some(socket) = st.socket.as_ref() else {
                    return;
                };
                event_loop.with_scratch(|buf| {
                    socket
                        .recv_from(buf)
                        .map(|(n, from)| (Bytes::copy_from_slice(&buf[..n]), from))
                })
            };
            match result {
                Ok((data, from)) => {
                    trace!(id = self.id, bytes = data.len(), %from, "Datagram received");
                    self.deliver(Ok((data, from)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Errors such as ICMP port unreachable do not stop reception
                    self.deliver(Err(e.into()));
                    return;
                }
            }
        }
    }
}

impl Source for UdpCore {
    fn id(&self) -> u64 {
        self.id
    }

    fn interest(&self) -> Option<(RawFd, PollFlags)> {
        let st = self.state.borrow();
        if st.closing {
            return None;
        }
        let fd = st.socket.as_ref()?.as_raw_fd();
        let mut events = PollFlags::empty();
        if st.receiving {
            events |= PollFlags::POLLIN;
        }
        if !st.sends.is_empty() {
            events |= PollFlags::POLLOUT;
        }
        if events.is_empty() {
            None
        } else {
            Some((fd, events))
        }
    }

    fn dispatch(self: Rc<Self>, revents: PollFlags) {
        let Ok(event_loop) = self.event_loop.upgrade() else {
            return;
        };
        if self.state.borrow().closing {
            return;
        }
        let failed = PollFlags::POLLERR | PollFlags::POLLHUP;
        if revents.intersects(PollFlags::POLLOUT | failed) && !self.state.borrow().sends.is_empty() {
            self.flush_sends();
        }
        if revents.intersects(PollFlags::POLLIN | failed) {
            self.recv_ready(&event_loop);
        }
    }

    fn is_active(&self) -> bool {
        let st = self.state.borrow();
        !st.closing && (st.receiving || !st.sends.is_empty())
    }

    fn finish_close(self: Rc<Self>) {
        let (socket, sends, callback) = {
            let mut st = self.state.borrow_mut();
            (
                st.socket.take(),
                std::mem::take(&mut st.sends),
                st.close_callback.take(),
            )
        };
        if !sends.is_empty() {
            debug!(id = self.id, dropped = sends.len(), "Dropping queued datagrams of closed socket");
        }
        drop((socket, sends));
        debug!(id = self.id, "UDP socket closed");
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Handle for Udp {
    fn kind(&self) -> HandleKind {
        HandleKind::Udp
    }

    fn is_active(&self) -> bool {
        Source::is_active(&*self.core)
    }

    fn is_closing(&self) -> bool {
        self.core.state.borrow().closing
    }

    fn request_close(&self, callback: Option<CloseCallback>) {
        let released = {
            let mut st = self.core.state.borrow_mut();
            if st.closing {
                warn!(id = self.core.id, "Close requested twice; ignoring");
                return;
            }
            st.closing = true;
            st.receiving = false;
            st.close_callback = callback;
            st.recv_callback.take()
        };
        drop(released);

        let source: Rc<dyn Source> = self.core.clone();
        match self.core.event_loop.upgrade() {
            Ok(event_loop) => event_loop.schedule_close(source),
            Err(_) => source.finish_close(),
        }
    }
}

impl Endpoint for Udp {
    fn export(&self) -> RuntimeResult<(TransferKind, OwnedFd)> {
        let st = self.core.state.borrow();
        if st.closing {
            return Err(RuntimeError::closing("send"));
        }
        let socket = st.socket.as_ref().ok_or_else(|| {
            RuntimeError::InvalidState("handle has no descriptor to send".to_string())
        })?;
        Ok((TransferKind::Udp, OwnedFd::from(socket.try_clone()?)))
    }

    fn check_adopt(&self, kind: TransferKind, _fd: BorrowedFd<'_>) -> RuntimeResult<()> {
        let st = self.core.state.borrow();
        if st.closing || st.socket.is_some() {
            return Err(RuntimeError::InvalidHandleTransfer(
                "accept target must be a freshly created handle".to_string(),
            ));
        }
        if kind != TransferKind::Udp {
            return Err(RuntimeError::InvalidHandleTransfer(format!(
                "cannot accept a {} handle into a udp handle",
                kind
            )));
        }
        Ok(())
    }

    fn adopt(&self, fd: OwnedFd, _origin: Origin) -> RuntimeResult<()> {
        let socket = UdpSocket::from(fd);
        socket.set_nonblocking(true)?;
        self.core.state.borrow_mut().socket = Some(socket);
        Ok(())
    }
}

impl Transferable for Udp {}

impl fmt::Debug for Udp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.core.state.borrow();
        f.debug_struct("Udp")
            .field("id", &self.core.id)
            .field("receiving", &st.receiving)
            .field("closing", &st.closing)
            .finish()
    }
}
