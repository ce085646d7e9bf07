//! Connection-oriented streams
//!
//! [`Stream`] is the part shared by [`Pipe`](crate::Pipe) and
//! [`Tcp`](crate::Tcp): reading, ordered writes, listening and accepting.
//! A pipe created with `ipc = true` is an IPC channel. Every write on it is
//! framed, and a frame may carry a descriptor that the receiver claims with
//! [`Stream::accept`] from inside its read callback.

use bytes::{Bytes, BytesMut};
use handoff_ipc::{encode_frame, recv_with_fds, send_with_fd, FrameDecoder, IpcError, TransferKind};
use nix::poll::PollFlags;
use nix::sys::socket::AddressFamily;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use tracing::{debug, trace, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::event_loop::{EventLoop, LoopRef, Source};
use crate::handle::private::{Endpoint, Origin};
use crate::handle::{CloseCallback, Handle, HandleKind, Transferable};
use crate::sys::{self, ConnectStatus};

pub type ReadCallback = Box<dyn FnMut(&Stream, RuntimeResult<Bytes>)>;
pub type WriteCallback = Box<dyn FnOnce(&Stream, RuntimeResult<()>)>;
pub type ConnectionCallback = Box<dyn FnMut(&Stream, RuntimeResult<()>)>;
pub type ConnectCallback = Box<dyn FnOnce(&Stream, RuntimeResult<()>)>;
pub type ShutdownCallback = Box<dyn FnOnce(&Stream, RuntimeResult<()>)>;

/// Reads attempted per readiness notification before yielding to other handles
const MAX_READS_PER_TICK: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Pipe,
    Tcp,
}

/// Where a stream is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// No descriptor yet
    Unbound,
    /// Has a local address but neither listens nor is connected
    Bound,
    Listening,
    Connecting,
    Open,
}

struct WriteRequest {
    data: Bytes,
    written: usize,
    /// Our own duplicate, dropped once the kernel took it with the first byte
    descriptor: Option<OwnedFd>,
    callback: Option<WriteCallback>,
}

struct PendingHandle {
    kind: TransferKind,
    fd: OwnedFd,
}

struct StreamState {
    fd: Option<OwnedFd>,
    role: StreamRole,
    /// Produced by accepting on a listening socket; announced as `Unknown`
    accepted: bool,
    closing: bool,
    close_callback: Option<CloseCallback>,
    reading: bool,
    read_callback: Option<ReadCallback>,
    connection_callback: Option<ConnectionCallback>,
    incoming: Option<OwnedFd>,
    connect_callback: Option<ConnectCallback>,
    writes: VecDeque<WriteRequest>,
    shutdown_requested: bool,
    shutdown_callback: Option<ShutdownCallback>,
    read_buf: BytesMut,
    decoder: FrameDecoder,
    received_fds: VecDeque<OwnedFd>,
    pending: Option<PendingHandle>,
    socket_path: Option<PathBuf>,
}

pub(crate) struct StreamCore {
    id: u64,
    kind: StreamKind,
    ipc: bool,
    event_loop: LoopRef,
    state: RefCell<StreamState>,
}

/// A pipe or TCP stream
#[derive(Clone)]
pub struct Stream {
    core: Rc<StreamCore>,
}

impl Stream {
    pub(crate) fn new(event_loop: &EventLoop, kind: StreamKind, ipc: bool) -> Self {
        let id = event_loop.allocate_id();
        let core = Rc::new(StreamCore {
            id,
            kind,
            ipc,
            event_loop: event_loop.downgrade(),
            state: RefCell::new(StreamState {
                fd: None,
                role: StreamRole::Unbound,
                accepted: false,
                closing: false,
                close_callback: None,
                reading: false,
                read_callback: None,
                connection_callback: None,
                incoming: None,
                connect_callback: None,
                writes: VecDeque::new(),
                shutdown_requested: false,
                shutdown_callback: None,
                read_buf: BytesMut::new(),
                decoder: FrameDecoder::new(event_loop.ipc_config().max_frame_len),
                received_fds: VecDeque::new(),
                pending: None,
                socket_path: None,
            }),
        });
        let source: Weak<dyn Source> = Rc::downgrade(&core) as Weak<dyn Source>;
        event_loop.register(id, source);
        trace!(id, ?kind, ipc, "Created stream");
        Self { core }
    }

    pub fn role(&self) -> StreamRole {
        self.core.state.borrow().role
    }

    pub(crate) fn is_ipc_channel(&self) -> bool {
        self.core.ipc
    }

    /// Start delivering data to `callback`.
    ///
    /// On an IPC channel the callback runs once per frame, otherwise once per
    /// chunk read. End of stream arrives as [`RuntimeError::EndOfStream`],
    /// after which reading is stopped.
    pub fn start_read<F>(&self, callback: F) -> RuntimeResult<()>
    where
        F: FnMut(&Stream, RuntimeResult<Bytes>) + 'static,
    {
        let mut st = self.core.state.borrow_mut();
        if st.closing {
            return Err(RuntimeError::closing("read"));
        }
        if st.role != StreamRole::Open {
            return Err(RuntimeError::InvalidState(
                "stream is not connected".to_string(),
            ));
        }
        if st.reading {
            return Err(RuntimeError::InvalidState(
                "stream is already reading".to_string(),
            ));
        }
        st.reading = true;
        st.read_callback = Some(Box::new(callback));
        Ok(())
    }

    /// Stop delivering data. A callback already running is not interrupted.
    pub fn stop_read(&self) -> RuntimeResult<()> {
        let callback = {
            let mut st = self.core.state.borrow_mut();
            if st.closing {
                return Err(RuntimeError::closing("stop_read"));
            }
            st.reading = false;
            st.read_callback.take()
        };
        drop(callback);
        Ok(())
    }

    /// Queue `data`; `callback` runs once the OS accepted all of it
    pub fn write<F>(&self, data: &[u8], callback: F) -> RuntimeResult<()>
    where
        F: FnOnce(&Stream, RuntimeResult<()>) + 'static,
    {
        self.queue_write(data, None, Box::new(callback))
    }

    /// Queue `data` together with a duplicate of `handle`'s descriptor.
    ///
    /// Only valid on an IPC channel. The request owns its own duplicate, so
    /// `handle` may be closed as soon as this returns.
    pub fn write_with_handle<F>(
        &self,
        data: &[u8],
        handle: &dyn Transferable,
        callback: F,
    ) -> RuntimeResult<()>
    where
        F: FnOnce(&Stream, RuntimeResult<()>) + 'static,
    {
        self.queue_write(data, Some(handle), Box::new(callback))
    }

    fn queue_write(
        &self,
        data: &[u8],
        handle: Option<&dyn Transferable>,
        callback: WriteCallback,
    ) -> RuntimeResult<()> {
        if handle.is_some() && !self.core.ipc {
            return Err(RuntimeError::UnsupportedOperation(
                "sending a handle requires an IPC pipe".to_string(),
            ));
        }
        {
            let st = self.core.state.borrow();
            if st.closing {
                return Err(RuntimeError::closing("write"));
            }
            if st.role != StreamRole::Open || st.fd.is_none() {
                return Err(RuntimeError::InvalidState(
                    "stream is not connected".to_string(),
                ));
            }
            if st.shutdown_requested {
                return Err(RuntimeError::InvalidState(
                    "write after shutdown".to_string(),
                ));
            }
        }

        let event_loop = self.core.event_loop.upgrade()?;
        let (attachment, descriptor) = match handle {
            Some(handle) => {
                let (kind, fd) = handle.export()?;
                (Some(kind), Some(fd))
            }
            None => (None, None),
        };
        let data = if self.core.ipc {
            encode_frame(data, attachment, event_loop.ipc_config().max_frame_len)?
        } else {
            Bytes::copy_from_slice(data)
        };

        trace!(id = self.core.id, bytes = data.len(), attachment = ?attachment, "Queued write");
        let first = {
            let mut st = self.core.state.borrow_mut();
            st.writes.push_back(WriteRequest {
                data,
                written: 0,
                descriptor,
                callback: Some(callback),
            });
            st.writes.len() == 1
        };
        if first {
            self.core.flush_writes();
        }
        Ok(())
    }

    /// Claim the connection or handle that is waiting on this stream.
    ///
    /// On a listening stream this must be called from the connection
    /// callback. On an IPC channel it must be called from the read callback
    /// of a frame whose [`pending_handle_type`](Self::pending_handle_type) is
    /// set. `target` must be freshly constructed and of a compatible kind.
    pub fn accept(&self, target: &dyn Transferable) -> RuntimeResult<()> {
        let origin = {
            let st = self.core.state.borrow();
            if st.closing {
                return Err(RuntimeError::closing("accept"));
            }

            let (origin, fd) = if st.role == StreamRole::Listening {
                let fd = st.incoming.as_ref().ok_or_else(|| {
                    RuntimeError::InvalidHandleTransfer(
                        "no connection is waiting to be accepted".to_string(),
                    )
                })?;
                (Origin::Accepted, fd)
            } else if self.core.ipc {
                let pending = st.pending.as_ref().ok_or_else(|| {
                    RuntimeError::InvalidHandleTransfer(
                        "no handle is pending on this channel".to_string(),
                    )
                })?;
                (Origin::Received(pending.kind), &pending.fd)
            } else {
                return Err(RuntimeError::UnsupportedOperation(
                    "accept requires a listening stream or an IPC pipe".to_string(),
                ));
            };

            let kind = match origin {
                Origin::Accepted => self.core.transfer_kind(false),
                Origin::Received(kind) => kind,
            };
            target.check_adopt(kind, fd.as_fd())?;
            origin
        };

        let fd = {
            let mut st = self.core.state.borrow_mut();
            match origin {
                Origin::Accepted => st.incoming.take(),
                Origin::Received(_) => st.pending.take().map(|pending| pending.fd),
            }
        };
        if let Some(fd) = fd {
            target.adopt(fd, origin)?;
            debug!(id = self.core.id, ?origin, "Accepted handle");
        }
        Ok(())
    }

    /// Listen for connections; `callback` runs once per inbound connection
    /// and must call [`accept`](Self::accept) before returning, or the
    /// connection is dropped.
    ///
    /// An accept error other than `EAGAIN` is delivered once and leaves the
    /// stream bound but no longer listening; call `listen` again to re-arm.
    pub fn listen<F>(&self, backlog: i32, callback: F) -> RuntimeResult<()>
    where
        F: FnMut(&Stream, RuntimeResult<()>) + 'static,
    {
        let mut st = self.core.state.borrow_mut();
        if st.closing {
            return Err(RuntimeError::closing("listen"));
        }
        match st.role {
            StreamRole::Bound => {}
            StreamRole::Listening => {
                return Err(RuntimeError::InvalidState(
                    "stream is already listening".to_string(),
                ))
            }
            _ => {
                return Err(RuntimeError::InvalidState(
                    "stream must be bound before listening".to_string(),
                ))
            }
        }
        let fd = st
            .fd
            .as_ref()
            .ok_or_else(|| RuntimeError::InvalidState("stream has no descriptor".to_string()))?;
        sys::listen(fd, backlog)?;
        st.role = StreamRole::Listening;
        st.connection_callback = Some(Box::new(callback));
        debug!(id = self.core.id, backlog, "Listening");
        Ok(())
    }

    /// Half-close the write side once every queued write has gone out
    pub fn shutdown<F>(&self, callback: F) -> RuntimeResult<()>
    where
        F: FnOnce(&Stream, RuntimeResult<()>) + 'static,
    {
        {
            let mut st = self.core.state.borrow_mut();
            if st.closing {
                return Err(RuntimeError::closing("shutdown"));
            }
            if st.role != StreamRole::Open {
                return Err(RuntimeError::InvalidState(
                    "stream is not connected".to_string(),
                ));
            }
            if st.shutdown_requested {
                return Err(RuntimeError::InvalidState(
                    "shutdown already requested".to_string(),
                ));
            }
            st.shutdown_requested = true;
            st.shutdown_callback = Some(Box::new(callback));
        }
        self.core.maybe_finish_shutdown();
        Ok(())
    }

    /// Kind of the handle attached to the frame being delivered, if any
    pub fn pending_handle_type(&self) -> Option<HandleKind> {
        self.core
            .state
            .borrow()
            .pending
            .as_ref()
            .map(|pending| pending.kind.into())
    }

    fn ensure_fresh(&self, what: &str) -> RuntimeResult<()> {
        let st = self.core.state.borrow();
        if st.closing {
            return Err(RuntimeError::closing(what));
        }
        if st.fd.is_some() {
            return Err(RuntimeError::InvalidState(format!(
                "{}: stream already has a descriptor",
                what
            )));
        }
        Ok(())
    }

    /// Take ownership of a descriptor after `bind`
    pub(crate) fn install_bound(&self, fd: OwnedFd, path: Option<PathBuf>) -> RuntimeResult<()> {
        self.ensure_fresh("bind")?;
        let mut st = self.core.state.borrow_mut();
        st.fd = Some(fd);
        st.role = StreamRole::Bound;
        st.socket_path = path;
        Ok(())
    }

    /// Take ownership of an existing socket such as an inherited stdio slot
    pub(crate) fn open_fd(&self, fd: OwnedFd) -> RuntimeResult<()> {
        self.ensure_fresh("open")?;
        if sys::family(fd.as_fd()).is_none() {
            return Err(RuntimeError::UnsupportedOperation(
                "only socket descriptors can be opened as streams".to_string(),
            ));
        }
        let fd = sys::set_nonblocking(fd)?;
        let role = detect_role(&fd);
        let mut st = self.core.state.borrow_mut();
        st.fd = Some(fd);
        st.role = role;
        debug!(id = self.core.id, ?role, "Opened stream on existing descriptor");
        Ok(())
    }

    /// Connect, creating the socket with `open` if the stream has none yet
    pub(crate) fn start_connect(
        &self,
        open: impl FnOnce() -> io::Result<OwnedFd>,
        connect: impl FnOnce(&OwnedFd) -> io::Result<ConnectStatus>,
        callback: ConnectCallback,
    ) -> RuntimeResult<()> {
        let needs_socket = {
            let st = self.core.state.borrow();
            if st.closing {
                return Err(RuntimeError::closing("connect"));
            }
            if !matches!(st.role, StreamRole::Unbound | StreamRole::Bound) {
                return Err(RuntimeError::InvalidState(
                    "stream is already connected or connecting".to_string(),
                ));
            }
            st.fd.is_none()
        };
        if needs_socket {
            let fd = open()?;
            self.core.state.borrow_mut().fd = Some(fd);
        }

        let status = {
            let st = self.core.state.borrow();
            match st.fd.as_ref() {
                Some(fd) => connect(fd),
                None => Err(io::Error::from(io::ErrorKind::NotConnected)),
            }
        };

        let mut st = self.core.state.borrow_mut();
        match status {
            Ok(ConnectStatus::Connected) => {
                st.role = StreamRole::Open;
                drop(st);
                self.core
                    .defer_callback(move |stream| callback(stream, Ok(())));
            }
            Ok(ConnectStatus::InProgress) => {
                st.role = StreamRole::Connecting;
                st.connect_callback = Some(callback);
            }
            Err(e) => {
                st.role = StreamRole::Unbound;
                let fd = st.fd.take();
                drop(st);
                drop(fd);
                self.core
                    .defer_callback(move |stream| callback(stream, Err(e.into())));
            }
        }
        Ok(())
    }

    /// Run `f` against the descriptor
    pub(crate) fn with_fd<R>(&self, f: impl FnOnce(&OwnedFd) -> io::Result<R>) -> RuntimeResult<R> {
        let st = self.core.state.borrow();
        if st.closing {
            return Err(RuntimeError::closing("socket query"));
        }
        let fd = st
            .fd
            .as_ref()
            .ok_or_else(|| RuntimeError::InvalidState("handle has no descriptor".to_string()))?;
        Ok(f(fd)?)
    }
}

fn detect_role(fd: &OwnedFd) -> StreamRole {
    if sys::is_listening(fd) {
        // Caller re-arms it with `listen`
        StreamRole::Bound
    } else if sys::has_peer(fd) {
        StreamRole::Open
    } else {
        StreamRole::Bound
    }
}

impl StreamCore {
    fn handle_kind(&self) -> HandleKind {
        match self.kind {
            StreamKind::Pipe => HandleKind::NamedPipe,
            StreamKind::Tcp => HandleKind::Tcp,
        }
    }

    /// Kind announced when this stream's descriptor is sent
    fn transfer_kind(&self, accepted: bool) -> TransferKind {
        match (self.kind, accepted) {
            (_, true) => TransferKind::Unknown,
            (StreamKind::Pipe, false) => TransferKind::NamedPipe,
            (StreamKind::Tcp, false) => TransferKind::Tcp,
        }
    }

    fn is_reading(&self) -> bool {
        let st = self.state.borrow();
        st.reading && !st.closing
    }

    fn defer_callback(self: &Rc<Self>, f: impl FnOnce(&Stream) + 'static) {
        let Ok(event_loop) = self.event_loop.upgrade() else {
            return;
        };
        let core = self.clone();
        event_loop.defer(move || {
            if core.state.borrow().closing {
                return;
            }
            f(&Stream { core });
        });
    }

    fn flush_writes(self: &Rc<Self>) {
        let mut completed: Vec<(Option<WriteCallback>, RuntimeResult<()>)> = Vec::new();
        {
            let mut st = self.state.borrow_mut();
            let StreamState { fd, writes, .. } = &mut *st;
            let Some(fd) = fd.as_ref() else {
                return;
            };

            while let Some(req) = writes.front_mut() {
                let chunk = &req.data[req.written..];
                let attachment = req.descriptor.as_ref().map(|d| d.as_fd());
                let outcome = match send_with_fd(fd.as_fd(), chunk, attachment) {
                    Ok(n) => {
                        if n > 0 {
                            req.descriptor = None;
                        }
                        req.written += n;
                        if req.written < req.data.len() {
                            if n == 0 {
                                break;
                            }
                            continue;
                        }
                        Ok(())
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!(id = self.id, "Write failed: {}", e);
                        Err(RuntimeError::from(e))
                    }
                };
                if let Some(req) = writes.pop_front() {
                    trace!(id = self.id, bytes = req.data.len(), ok = outcome.is_ok(), "Write finished");
                    completed.push((req.callback, outcome));
                }
            }
        }

        for (callback, result) in completed {
            if let Some(callback) = callback {
                self.defer_callback(move |stream| callback(stream, result));
            }
        }
        self.maybe_finish_shutdown();
    }

    fn maybe_finish_shutdown(self: &Rc<Self>) {
        let (callback, result) = {
            let mut st = self.state.borrow_mut();
            if !st.writes.is_empty() {
                return;
            }
            let Some(callback) = st.shutdown_callback.take() else {
                return;
            };
            let result = match st.fd.as_ref() {
                Some(fd) => sys::shutdown_write(fd),
                None => Err(io::Error::from(io::ErrorKind::NotConnected)),
            };
            (callback, result)
        };
        debug!(id = self.id, ok = result.is_ok(), "Shut down write side");
        self.defer_callback(move |stream| callback(stream, result.map_err(RuntimeError::from)));
    }

    fn deliver_read(self: &Rc<Self>, result: RuntimeResult<Bytes>) {
        let callback = self.state.borrow_mut().read_callback.take();
        let Some(mut callback) = callback else {
            return;
        };
        callback(&Stream { core: self.clone() }, result);
        let mut st = self.state.borrow_mut();
        if st.reading && !st.closing && st.read_callback.is_none() {
            st.read_callback = Some(callback);
        }
    }

    fn deliver_connection(self: &Rc<Self>, result: RuntimeResult<()>) {
        let callback = self.state.borrow_mut().connection_callback.take();
        let Some(mut callback) = callback else {
            return;
        };
        callback(&Stream { core: self.clone() }, result);
        let mut st = self.state.borrow_mut();
        if st.role == StreamRole::Listening && !st.closing && st.connection_callback.is_none() {
            st.connection_callback = Some(callback);
        }
    }

    /// Stop reading and drop everything buffered for the read side
    fn reset_read_side(&self) -> (VecDeque<OwnedFd>, bool) {
        let mut st = self.state.borrow_mut();
        st.reading = false;
        let partial = st.decoder.is_mid_frame(&st.read_buf);
        st.read_buf.clear();
        st.decoder.reset();
        (std::mem::take(&mut st.received_fds), partial)
    }

    fn end_of_stream(self: &Rc<Self>) {
        let (fds, partial) = self.reset_read_side();
        if partial || !fds.is_empty() {
            debug!(
                id = self.id,
                descriptors = fds.len(),
                partial,
                "Peer closed mid-frame; discarding buffered input"
            );
        }
        drop(fds);
        self.deliver_read(Err(RuntimeError::EndOfStream));
    }

    fn fail_read(self: &Rc<Self>, err: RuntimeError) {
        let (fds, _) = self.reset_read_side();
        drop(fds);
        debug!(id = self.id, "Read failed: {}", err);
        self.deliver_read(Err(err));
    }

    fn read_chunks(self: &Rc<Self>, event_loop: &EventLoop) {
        let mut stray = VecDeque::new();
        for _ in 0..MAX_READS_PER_TICK {
            if !self.is_reading() {
                return;
            }
            let result = {
                let st = self.state.borrow();
                let Some(fd) = st.fd.as_ref() else {
                    return;
                };
                event_loop.with_scratch(|buf| {
                    recv_with_fds(fd.as_fd(), buf, &mut stray, 0)
                        .map(|n| Bytes::copy_from_slice(&buf[..n]))
                })
            };
            match result {
                Ok(bytes) if bytes.is_empty() => {
                    self.end_of_stream();
                    return;
                }
                Ok(bytes) => {
                    trace!(id = self.id, bytes = bytes.len(), "Read chunk");
                    self.deliver_read(Ok(bytes));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    self.fail_read(e.into());
                    return;
                }
            }
        }
    }

    fn read_frames(self: &Rc<Self>, event_loop: &EventLoop, mut can_read: bool) {
        let max_fds = event_loop.ipc_config().max_fds_per_message;
        let mut reads_left = MAX_READS_PER_TICK;

        loop {
            // Hand out everything already buffered
            loop {
                if !self.is_reading() {
                    return;
                }
                let decoded = {
                    let mut st = self.state.borrow_mut();
                    let StreamState {
                        decoder, read_buf, ..
                    } = &mut *st;
                    decoder.decode(read_buf)
                };
                match decoded {
                    Ok(Some(frame)) => {
                        if !self.deliver_frame(frame.attachment, frame.payload) {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.fail_read(e.into());
                        return;
                    }
                }
            }

            if !can_read || reads_left == 0 {
                return;
            }
            reads_left -= 1;

            let result = {
                let mut st = self.state.borrow_mut();
                let StreamState {
                    fd,
                    read_buf,
                    received_fds,
                    ..
                } = &mut *st;
                let Some(fd) = fd.as_ref() else {
                    return;
                };
                event_loop.with_scratch(|buf| -> io::Result<usize> {
                    let n = recv_with_fds(fd.as_fd(), buf, received_fds, max_fds)?;
                    read_buf.extend_from_slice(&buf[..n]);
                    Ok(n)
                })
            };
            match result {
                Ok(0) => {
                    self.end_of_stream();
                    return;
                }
                Ok(n) => trace!(id = self.id, bytes = n, "Read from channel"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => can_read = false,
                Err(e) => {
                    self.fail_read(e.into());
                    return;
                }
            }
        }
    }

    /// Deliver one frame; false when the channel had to stop reading
    fn deliver_frame(self: &Rc<Self>, attachment: Option<TransferKind>, payload: Bytes) -> bool {
        let pending = match attachment {
            Some(kind) => {
                let fd = self.state.borrow_mut().received_fds.pop_front();
                match fd {
                    Some(fd) => Some(PendingHandle { kind, fd }),
                    None => {
                        self.fail_read(IpcError::MissingDescriptor(kind).into());
                        return false;
                    }
                }
            }
            None => None,
        };

        trace!(id = self.id, bytes = payload.len(), attachment = ?attachment, "Frame received");
        self.state.borrow_mut().pending = pending;
        self.deliver_read(Ok(payload));

        let unclaimed = self.state.borrow_mut().pending.take();
        if let Some(pending) = unclaimed {
            warn!(
                id = self.id,
                kind = %pending.kind,
                "Transferred handle was not accepted; closing its descriptor"
            );
        }
        true
    }

    fn accept_ready(self: &Rc<Self>, event_loop: &EventLoop) {
        for _ in 0..event_loop.config().max_accepts_per_tick {
            let result = {
                let st = self.state.borrow();
                if st.closing
                    || st.role != StreamRole::Listening
                    || st.connection_callback.is_none()
                {
                    return;
                }
                let Some(fd) = st.fd.as_ref() else {
                    return;
                };
                sys::accept(fd)
            };
            match result {
                Ok(conn) => {
                    self.state.borrow_mut().incoming = Some(conn);
                    self.deliver_connection(Ok(()));
                    let dropped = self.state.borrow_mut().incoming.take();
                    if dropped.is_some() {
                        debug!(id = self.id, "Connection was not accepted; dropping it");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    // The listener stays readable on errors such as EMFILE;
                    // stop watching it until `listen` is called again
                    warn!(id = self.id, "Accept failed; listener disarmed: {}", e);
                    self.state.borrow_mut().role = StreamRole::Bound;
                    self.deliver_connection(Err(e.into()));
                    return;
                }
            }
        }
    }

    fn finish_connect(self: &Rc<Self>) {
        let outcome = {
            let st = self.state.borrow();
            let Some(fd) = st.fd.as_ref() else {
                return;
            };
            match sys::take_error(fd) {
                Ok(None) => Ok(()),
                Ok(Some(e)) | Err(e) => Err(e),
            }
        };

        let (callback, dropped) = {
            let mut st = self.state.borrow_mut();
            let dropped = match outcome {
                Ok(()) => {
                    st.role = StreamRole::Open;
                    None
                }
                Err(_) => {
                    st.role = StreamRole::Unbound;
                    st.fd.take()
                }
            };
            (st.connect_callback.take(), dropped)
        };
        drop(dropped);
        debug!(id = self.id, ok = outcome.is_ok(), "Connect finished");

        if let Some(callback) = callback {
            callback(&Stream { core: self.clone() }, outcome.map_err(RuntimeError::from));
        }
    }
}

impl Source for StreamCore {
    fn id(&self) -> u64 {
        self.id
    }

    fn interest(&self) -> Option<(RawFd, PollFlags)> {
        let st = self.state.borrow();
        if st.closing {
            return None;
        }
        let fd = st.fd.as_ref()?.as_raw_fd();
        let mut events = PollFlags::empty();
        match st.role {
            StreamRole::Listening if st.connection_callback.is_some() => {
                events |= PollFlags::POLLIN;
            }
            StreamRole::Connecting => events |= PollFlags::POLLOUT,
            StreamRole::Open => {
                if st.reading {
                    events |= PollFlags::POLLIN;
                }
                if !st.writes.is_empty() {
                    events |= PollFlags::POLLOUT;
                }
            }
            _ => {}
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
        let (role, has_writes) = {
            let st = self.state.borrow();
            if st.closing {
                return;
            }
            (st.role, !st.writes.is_empty())
        };
        let failed = PollFlags::POLLERR | PollFlags::POLLHUP;

        match role {
            StreamRole::Listening => self.accept_ready(&event_loop),
            StreamRole::Connecting => {
                if revents.intersects(PollFlags::POLLOUT | failed) {
                    self.finish_connect();
                }
            }
            StreamRole::Open => {
                if has_writes && revents.intersects(PollFlags::POLLOUT | failed) {
                    self.flush_writes();
                }
                let readable = revents.intersects(PollFlags::POLLIN | failed);
                if self.is_reading() && (readable || revents.is_empty()) {
                    if self.ipc {
                        self.read_frames(&event_loop, readable);
                    } else {
                        self.read_chunks(&event_loop);
                    }
                }
            }
            StreamRole::Unbound | StreamRole::Bound => {}
        }
    }

    fn has_pending_input(&self) -> bool {
        let st = self.state.borrow();
        self.ipc && st.reading && !st.closing && st.decoder.has_complete_frame(&st.read_buf)
    }

    fn is_active(&self) -> bool {
        let st = self.state.borrow();
        !st.closing
            && (st.reading
                || st.role == StreamRole::Listening
                || st.role == StreamRole::Connecting
                || !st.writes.is_empty()
                || st.shutdown_callback.is_some())
    }

    fn finish_close(self: Rc<Self>) {
        let (fd, writes, fds, pending, incoming, path, callback) = {
            let mut st = self.state.borrow_mut();
            st.read_buf.clear();
            st.decoder.reset();
            (
                st.fd.take(),
                std::mem::take(&mut st.writes),
                std::mem::take(&mut st.received_fds),
                st.pending.take(),
                st.incoming.take(),
                st.socket_path.take(),
                st.close_callback.take(),
            )
        };
        if !writes.is_empty() {
            debug!(id = self.id, dropped = writes.len(), "Dropping queued writes of closed stream");
        }
        drop((fd, writes, fds, pending, incoming));
        if let Some(path) = path {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(id = self.id, "Could not remove socket file {}: {}", path.display(), e);
            }
        }
        debug!(id = self.id, "Stream closed");
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Handle for Stream {
    fn kind(&self) -> HandleKind {
        self.core.handle_kind()
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
            st.reading = false;
            st.close_callback = callback;
            (
                st.read_callback.take(),
                st.connection_callback.take(),
                st.connect_callback.take(),
                st.shutdown_callback.take(),
            )
        };
        drop(released);
        debug!(id = self.core.id, kind = %self.core.handle_kind(), "Closing stream");

        let source: Rc<dyn Source> = self.core.clone();
        match self.core.event_loop.upgrade() {
            Ok(event_loop) => event_loop.schedule_close(source),
            Err(_) => source.finish_close(),
        }
    }
}

impl Endpoint for Stream {
    fn export(&self) -> RuntimeResult<(TransferKind, OwnedFd)> {
        let st = self.core.state.borrow();
        if st.closing {
            return Err(RuntimeError::closing("send"));
        }
        let fd = st.fd.as_ref().ok_or_else(|| {
            RuntimeError::InvalidState("handle has no descriptor to send".to_string())
        })?;
        Ok((self.core.transfer_kind(st.accepted), fd.try_clone()?))
    }

    fn check_adopt(&self, kind: TransferKind, fd: BorrowedFd<'_>) -> RuntimeResult<()> {
        let st = self.core.state.borrow();
        if st.closing || st.fd.is_some() {
            return Err(RuntimeError::InvalidHandleTransfer(
                "accept target must be a freshly created handle".to_string(),
            ));
        }
        let compatible = match (kind, self.core.kind) {
            (TransferKind::NamedPipe, StreamKind::Pipe) | (TransferKind::Tcp, StreamKind::Tcp) => true,
            // Only the socket itself can tell what an unknown connection is
            (TransferKind::Unknown, StreamKind::Pipe) => sys::family(fd) == Some(AddressFamily::Unix),
            (TransferKind::Unknown, StreamKind::Tcp) => matches!(
                sys::family(fd),
                Some(AddressFamily::Inet | AddressFamily::Inet6)
            ),
            _ => false,
        };
        if !compatible {
            return Err(RuntimeError::InvalidHandleTransfer(format!(
                "cannot accept a {} handle into a {} handle",
                kind,
                self.core.handle_kind()
            )));
        }
        Ok(())
    }

    fn adopt(&self, fd: OwnedFd, origin: Origin) -> RuntimeResult<()> {
        let fd = sys::set_nonblocking(fd)?;
        let role = match origin {
            Origin::Accepted => StreamRole::Open,
            Origin::Received(_) => detect_role(&fd),
        };
        let mut st = self.core.state.borrow_mut();
        st.fd = Some(fd);
        st.role = role;
        st.accepted = matches!(
            origin,
            Origin::Accepted | Origin::Received(TransferKind::Unknown)
        );
        Ok(())
    }
}

impl Transferable for Stream {}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.core.state.borrow();
        f.debug_struct("Stream")
            .field("id", &self.core.id)
            .field("kind", &self.core.kind)
            .field("ipc", &self.core.ipc)
            .field("role", &st.role)
            .field("closing", &st.closing)
            .finish()
    }
}

/// Implement `Deref<Target = Stream>` and the handle traits for a stream wrapper
macro_rules! delegate_stream_handle {
    ($ty:ident) => {
        impl std::ops::Deref for $ty {
            type Target = $crate::stream::Stream;

            fn deref(&self) -> &Self::Target {
                &self.stream
            }
        }

        impl $crate::handle::Handle for $ty {
            fn kind(&self) -> $crate::handle::HandleKind {
                $crate::handle::Handle::kind(&self.stream)
            }

            fn is_active(&self) -> bool {
                $crate::handle::Handle::is_active(&self.stream)
            }

            fn is_closing(&self) -> bool {
                $crate::handle::Handle::is_closing(&self.stream)
            }

            fn request_close(&self, callback: Option<$crate::handle::CloseCallback>) {
                $crate::handle::Handle::request_close(&self.stream, callback)
            }
        }

        impl $crate::handle::private::Endpoint for $ty {
            fn export(
                &self,
            ) -> $crate::error::RuntimeResult<(handoff_ipc::TransferKind, std::os::fd::OwnedFd)> {
                $crate::handle::private::Endpoint::export(&self.stream)
            }

            fn check_adopt(
                &self,
                kind: handoff_ipc::TransferKind,
                fd: std::os::fd::BorrowedFd<'_>,
            ) -> $crate::error::RuntimeResult<()> {
                $crate::handle::private::Endpoint::check_adopt(&self.stream, kind, fd)
            }

            fn adopt(
                &self,
                fd: std::os::fd::OwnedFd,
                origin: $crate::handle::private::Origin,
            ) -> $crate::error::RuntimeResult<()> {
                $crate::handle::private::Endpoint::adopt(&self.stream, fd, origin)
            }
        }

        impl $crate::handle::Transferable for $ty {}
    };
}

pub(crate) use delegate_stream_handle;
