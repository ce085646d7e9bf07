//! Single-threaded event loop
//!
//! One iteration polls every registered descriptor plus the wake socket,
//! dispatches I/O callbacks, delivers process exits, runs deferred
//! completions and finally completes pending closes. Nothing here is `Send`:
//! the only off-thread activity is the process waiter threads, which talk to
//! the loop through an `mpsc` channel and a byte on the wake socket.

use handoff_config::{EventLoopConfig, HandoffConfig, IpcConfig, Validatable};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::ExitStatus;
use std::rc::{Rc, Weak};
use std::sync::mpsc;
use tracing::{debug, error, trace};

use crate::error::{RuntimeError, RuntimeResult};
use crate::process::{self, ProcessCore};

type Deferred = Box<dyn FnOnce()>;

/// Something the loop polls on behalf of a handle
pub(crate) trait Source {
    fn id(&self) -> u64;

    /// Descriptor and events to poll for, if any
    fn interest(&self) -> Option<(RawFd, PollFlags)>;

    /// React to readiness. `revents` is empty when the source asked to be
    /// run because it already holds buffered input.
    fn dispatch(self: Rc<Self>, revents: PollFlags);

    fn has_pending_input(&self) -> bool {
        false
    }

    fn is_active(&self) -> bool;

    /// Release resources and run the close callback
    fn finish_close(self: Rc<Self>);
}

/// Exit status posted by a waiter thread
pub(crate) struct ExitNotice {
    pub id: u64,
    pub status: io::Result<ExitStatus>,
}

/// Sending half used by waiter threads
pub(crate) struct ExitNotifier {
    tx: mpsc::Sender<ExitNotice>,
    waker: UnixStream,
}

impl ExitNotifier {
    pub fn notify(self, notice: ExitNotice) {
        if self.tx.send(notice).is_err() {
            // Loop is gone, nobody to tell
            return;
        }
        // A full socket already holds a pending wake-up
        let _ = (&self.waker).write(&[1]);
    }
}

pub(crate) struct LoopInner {
    config: EventLoopConfig,
    ipc: IpcConfig,
    sources: RefCell<BTreeMap<u64, Weak<dyn Source>>>,
    next_id: Cell<u64>,
    deferred: RefCell<VecDeque<Deferred>>,
    closing: RefCell<Vec<Rc<dyn Source>>>,
    processes: RefCell<HashMap<u64, Rc<ProcessCore>>>,
    running: Cell<bool>,
    stop_requested: Cell<bool>,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
    exit_tx: mpsc::Sender<ExitNotice>,
    exit_rx: mpsc::Receiver<ExitNotice>,
    scratch: RefCell<Vec<u8>>,
}

/// Event loop driving every handle created on it
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

/// Non-owning reference held by handles
#[derive(Clone)]
pub(crate) struct LoopRef(Weak<LoopInner>);

impl LoopRef {
    pub fn upgrade(&self) -> RuntimeResult<EventLoop> {
        self.0
            .upgrade()
            .map(|inner| EventLoop { inner })
            .ok_or_else(|| RuntimeError::InvalidState("event loop has been dropped".to_string()))
    }
}

impl EventLoop {
    /// Create a loop with default configuration
    pub fn new() -> RuntimeResult<Self> {
        Self::build(EventLoopConfig::default(), IpcConfig::default())
    }

    /// Create a loop with the given event loop settings
    pub fn with_config(config: &EventLoopConfig) -> RuntimeResult<Self> {
        config.validate()?;
        Self::build(config.clone(), IpcConfig::default())
    }

    /// Create a loop from a complete configuration
    pub fn from_config(config: &HandoffConfig) -> RuntimeResult<Self> {
        config.validate_all()?;
        Self::build(config.event_loop.clone(), config.ipc.clone())
    }

    fn build(config: EventLoopConfig, ipc: IpcConfig) -> RuntimeResult<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        let (exit_tx, exit_rx) = mpsc::channel();

        debug!(
            read_buffer_size = config.read_buffer_size,
            max_frame_len = ipc.max_frame_len,
            "Creating event loop"
        );

        let scratch = vec![0u8; config.read_buffer_size];
        Ok(Self {
            inner: Rc::new(LoopInner {
                config,
                ipc,
                sources: RefCell::new(BTreeMap::new()),
                next_id: Cell::new(1),
                deferred: RefCell::new(VecDeque::new()),
                closing: RefCell::new(Vec::new()),
                processes: RefCell::new(HashMap::new()),
                running: Cell::new(false),
                stop_requested: Cell::new(false),
                wake_rx,
                wake_tx,
                exit_tx,
                exit_rx,
                scratch: RefCell::new(scratch),
            }),
        })
    }

    /// Run until no handle is active and no callback or close is pending,
    /// or until [`stop`](Self::stop) is called.
    pub fn run(&self) -> RuntimeResult<()> {
        self.enter()?;
        let result = self.run_until_idle();
        self.inner.running.set(false);
        self.inner.stop_requested.set(false);
        result
    }

    /// Run a single iteration, blocking for I/O if nothing is ready.
    ///
    /// Returns whether the loop is still alive afterwards.
    pub fn run_once(&self) -> RuntimeResult<bool> {
        self.enter()?;
        let result = self.tick();
        self.inner.running.set(false);
        result
    }

    /// Make `run` return after the current iteration
    pub fn stop(&self) {
        self.inner.stop_requested.set(true);
    }

    /// Whether anything would keep `run` going
    pub fn is_alive(&self) -> bool {
        if !self.inner.deferred.borrow().is_empty()
            || !self.inner.closing.borrow().is_empty()
            || !self.inner.processes.borrow().is_empty()
        {
            return true;
        }
        self.inner
            .sources
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .any(|source| source.is_active() || source.has_pending_input())
    }

    fn enter(&self) -> RuntimeResult<()> {
        if self.inner.running.replace(true) {
            return Err(RuntimeError::InvalidState(
                "event loop is already running".to_string(),
            ));
        }
        Ok(())
    }

    fn run_until_idle(&self) -> RuntimeResult<()> {
        while !self.inner.stop_requested.get() {
            if !self.tick()? {
                break;
            }
        }
        Ok(())
    }

    fn tick(&self) -> RuntimeResult<bool> {
        if !self.is_alive() {
            return Ok(false);
        }
        self.poll_io()?;
        self.run_deferred();
        self.run_closing();
        Ok(self.is_alive())
    }

    fn poll_io(&self) -> RuntimeResult<()> {
        let mut buffered = Vec::new();
        let mut watched: Vec<(u64, RawFd, PollFlags)> = Vec::new();
        {
            let mut sources = self.inner.sources.borrow_mut();
            sources.retain(|_, weak| weak.strong_count() > 0);
            for (&id, weak) in sources.iter() {
                let Some(source) = weak.upgrade() else {
                    continue;
                };
                if source.has_pending_input() {
                    buffered.push(id);
                }
                if let Some((fd, events)) = source.interest() {
                    watched.push((id, fd, events));
                }
            }
        }

        let immediate = !buffered.is_empty()
            || !self.inner.deferred.borrow().is_empty()
            || !self.inner.closing.borrow().is_empty()
            || self.inner.stop_requested.get();
        let timeout = if immediate {
            PollTimeout::ZERO
        } else {
            PollTimeout::NONE
        };

        let (woken, ready) = {
            let mut fds: Vec<PollFd<'_>> = Vec::with_capacity(watched.len() + 1);
            fds.push(PollFd::new(self.inner.wake_rx.as_fd(), PollFlags::POLLIN));
            for &(_, raw, events) in &watched {
                // SAFETY: each descriptor is owned by a live handle and is only
                // released when a close completes, never while polling.
                let fd = unsafe { BorrowedFd::borrow_raw(raw) };
                fds.push(PollFd::new(fd, events));
            }

            loop {
                match poll(&mut fds, timeout) {
                    Ok(_) => break,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        error!("poll failed: {}", e);
                        return Err(e.into());
                    }
                }
            }

            let woken = fds[0].revents().is_some_and(|r| !r.is_empty());
            let ready: Vec<(u64, PollFlags)> = watched
                .iter()
                .zip(&fds[1..])
                .filter_map(|(&(id, _, _), pfd)| {
                    pfd.revents()
                        .filter(|r| !r.is_empty())
                        .map(|revents| (id, revents))
                })
                .collect();
            (woken, ready)
        };

        trace!(ready = ready.len(), buffered = buffered.len(), woken, "poll returned");

        for &(id, revents) in &ready {
            self.dispatch(id, revents);
        }
        for id in buffered {
            if !ready.iter().any(|&(ready_id, _)| ready_id == id) {
                self.dispatch(id, PollFlags::empty());
            }
        }

        if woken {
            self.drain_wake();
            self.reap_exits();
        }
        Ok(())
    }

    fn dispatch(&self, id: u64, revents: PollFlags) {
        let source = self.inner.sources.borrow().get(&id).and_then(Weak::upgrade);
        if let Some(source) = source {
            source.dispatch(revents);
        }
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.inner.wake_rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    fn reap_exits(&self) {
        while let Ok(notice) = self.inner.exit_rx.try_recv() {
            let process = self.inner.processes.borrow_mut().remove(&notice.id);
            match process {
                Some(process) => process::deliver_exit(process, notice.status),
                None => debug!(id = notice.id, "Exit notice for unknown process"),
            }
        }
    }

    fn run_deferred(&self) {
        let batch = std::mem::take(&mut *self.inner.deferred.borrow_mut());
        for callback in batch {
            callback();
        }
    }

    fn run_closing(&self) {
        let batch = std::mem::take(&mut *self.inner.closing.borrow_mut());
        for source in batch {
            self.inner.sources.borrow_mut().remove(&source.id());
            source.finish_close();
        }
    }

    pub(crate) fn downgrade(&self) -> LoopRef {
        LoopRef(Rc::downgrade(&self.inner))
    }

    pub(crate) fn config(&self) -> &EventLoopConfig {
        &self.inner.config
    }

    pub(crate) fn ipc_config(&self) -> &IpcConfig {
        &self.inner.ipc
    }

    pub(crate) fn allocate_id(&self) -> u64 {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        id
    }

    pub(crate) fn register(&self, id: u64, source: Weak<dyn Source>) {
        self.inner.sources.borrow_mut().insert(id, source);
    }

    /// Queue a callback for the deferred phase of the next iteration
    pub(crate) fn defer<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.inner.deferred.borrow_mut().push_back(Box::new(callback));
    }

    /// Keep `source` alive until its close completes
    pub(crate) fn schedule_close(&self, source: Rc<dyn Source>) {
        self.inner.closing.borrow_mut().push(source);
    }

    pub(crate) fn track_process(&self, id: u64, process: Rc<ProcessCore>) {
        self.inner.processes.borrow_mut().insert(id, process);
    }

    pub(crate) fn exit_notifier(&self) -> io::Result<ExitNotifier> {
        Ok(ExitNotifier {
            tx: self.inner.exit_tx.clone(),
            waker: self.inner.wake_tx.try_clone()?,
        })
    }

    /// Run `f` with the shared read buffer
    pub(crate) fn with_scratch<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut scratch = self.inner.scratch.borrow_mut();
        f(&mut scratch)
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("sources", &self.inner.sources.borrow().len())
            .field("deferred", &self.inner.deferred.borrow().len())
            .field("closing", &self.inner.closing.borrow().len())
            .field("processes", &self.inner.processes.borrow().len())
            .finish()
    }
}
