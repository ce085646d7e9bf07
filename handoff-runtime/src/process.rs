//! Child processes with stdio wiring
//!
//! Spawning returns immediately. A waiter thread blocks in `wait()` and posts
//! the exit status back to the loop, which runs the exit callback on the loop
//! thread exactly once.

use bitflags::bitflags;
use nix::poll::PollFlags;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::cell::RefCell;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::rc::Rc;
use std::thread;
use tracing::{debug, error, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::event_loop::{EventLoop, ExitNotice, LoopRef, Source};
use crate::handle::private::Endpoint;
use crate::handle::{CloseCallback, Handle, HandleKind};
use crate::pipe::Pipe;
use crate::stream::{Stream, StreamRole};

bitflags! {
    /// Direction of a created pipe, seen from the child
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipeFlags: u8 {
        /// The child reads from it
        const READABLE = 0b01;
        /// The child writes to it
        const WRITABLE = 0b10;
    }
}

/// What the child gets in one stdio slot
pub enum StdioContainer {
    /// Same descriptor as the parent (slots 0 to 2 only; higher slots stay closed)
    Inherit,
    /// `/dev/null` for slots 0 to 2, closed otherwise
    Ignore,
    /// This descriptor
    InheritFd(OwnedFd),
    /// A duplicate of an existing stream's descriptor
    InheritStream(Stream),
    /// A new socket pair; the parent's end is opened in `pipe`
    CreatePipe { pipe: Pipe, flags: PipeFlags },
}

pub type ExitCallback = Box<dyn FnOnce(&Process, i64, i32)>;

/// What to run and how to wire it
pub struct ProcessOptions {
    pub file: PathBuf,
    /// Arguments after the program name
    pub args: Vec<OsString>,
    /// Full environment of the child; `None` inherits the parent's
    pub env: Option<Vec<(OsString, OsString)>>,
    pub cwd: Option<PathBuf>,
    /// Slot `i` of this vector becomes descriptor `i` in the child
    pub stdio: Vec<StdioContainer>,
    pub exit_callback: Option<ExitCallback>,
}

impl ProcessOptions {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            args: Vec::new(),
            env: None,
            cwd: None,
            stdio: Vec::new(),
            exit_callback: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a variable to the child's environment, which then starts empty
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdio(mut self, stdio: Vec<StdioContainer>) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn on_exit<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Process, i64, i32) + 'static,
    {
        self.exit_callback = Some(Box::new(callback));
        self
    }
}

struct ProcessState {
    exit_status: Option<i64>,
    term_signal: Option<i32>,
    exit_callback: Option<ExitCallback>,
    closing: bool,
    close_callback: Option<CloseCallback>,
}

pub(crate) struct ProcessCore {
    id: u64,
    pid: u32,
    event_loop: LoopRef,
    state: RefCell<ProcessState>,
}

/// A spawned child process
#[derive(Clone)]
pub struct Process {
    core: Rc<ProcessCore>,
}

fn set_stdio(command: &mut Command, slot: usize, stdio: Stdio) {
    match slot {
        0 => command.stdin(stdio),
        1 => command.stdout(stdio),
        _ => command.stderr(stdio),
    };
}

fn spawn_error(err: io::Error) -> RuntimeError {
    RuntimeError::SpawnFailure(err)
}

impl Process {
    /// Spawn `options.file` and wire its stdio.
    ///
    /// Created pipes are open in the parent as soon as this returns. Failure
    /// to start the program is reported here as
    /// [`RuntimeError::SpawnFailure`].
    pub fn spawn(event_loop: &EventLoop, options: ProcessOptions) -> RuntimeResult<Process> {
        let ProcessOptions {
            file,
            args,
            env,
            cwd,
            stdio,
            exit_callback,
        } = options;

        let mut command = Command::new(&file);
        command.args(&args);
        if let Some(env) = env {
            command.env_clear();
            command.envs(env);
        }
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let mut parent_ends: Vec<(Pipe, OwnedFd)> = Vec::new();
        let mut extra: Vec<(RawFd, OwnedFd)> = Vec::new();

        for (slot, container) in stdio.into_iter().enumerate() {
            let child_end = match container {
                StdioContainer::Inherit => {
                    if slot < 3 {
                        set_stdio(&mut command, slot, Stdio::inherit());
                    }
                    None
                }
                StdioContainer::Ignore => {
                    if slot < 3 {
                        set_stdio(&mut command, slot, Stdio::null());
                    }
                    None
                }
                StdioContainer::InheritFd(fd) => Some(fd),
                StdioContainer::InheritStream(stream) => Some(stream.export()?.1),
                StdioContainer::CreatePipe { pipe, flags } => {
                    if flags.is_empty() {
                        return Err(RuntimeError::InvalidState(format!(
                            "stdio slot {} pipe must be readable or writable",
                            slot
                        )));
                    }
                    if pipe.is_closing() || pipe.role() != StreamRole::Unbound {
                        return Err(RuntimeError::InvalidState(format!(
                            "stdio slot {} needs a freshly created pipe",
                            slot
                        )));
                    }
                    let (parent, child) = UnixStream::pair().map_err(spawn_error)?;
                    if !flags.contains(PipeFlags::READABLE) {
                        child.shutdown(Shutdown::Read).map_err(spawn_error)?;
                    }
                    if !flags.contains(PipeFlags::WRITABLE) {
                        child.shutdown(Shutdown::Write).map_err(spawn_error)?;
                    }
                    parent_ends.push((pipe, OwnedFd::from(parent)));
                    Some(OwnedFd::from(child))
                }
            };

            if let Some(fd) = child_end {
                if slot < 3 {
                    set_stdio(&mut command, slot, Stdio::from(fd));
                } else {
                    extra.push((slot as RawFd, fd));
                }
            }
        }

        if !extra.is_empty() {
            let mut mapping: Vec<(RawFd, RawFd)> =
                extra.iter().map(|(slot, fd)| (fd.as_raw_fd(), *slot)).collect();
            let floor = mapping.iter().map(|&(_, slot)| slot).max().unwrap_or(2) + 1;
            // SAFETY: the hook runs between fork and exec and only calls
            // async-signal-safe functions on descriptors the parent keeps
            // open until the child has been spawned. It does not allocate.
            unsafe {
                command.pre_exec(move || {
                    // Move sources above every target slot so no dup2 below
                    // clobbers a source that is still needed
                    for entry in mapping.iter_mut() {
                        let moved = nix::libc::fcntl(entry.0, nix::libc::F_DUPFD_CLOEXEC, floor);
                        if moved < 0 {
                            return Err(io::Error::last_os_error());
                        }
                        entry.0 = moved;
                    }
                    for &(source, target) in mapping.iter() {
                        if nix::libc::dup2(source, target) < 0 {
                            return Err(io::Error::last_os_error());
                        }
                    }
                    Ok(())
                });
            }
        }

        let notifier = event_loop.exit_notifier().map_err(spawn_error)?;
        let mut child = command.spawn().map_err(|e| {
            debug!("Failed to spawn {}: {}", file.display(), e);
            spawn_error(e)
        })?;
        // Child ends live in `command` and `extra`; the parent must not keep them
        drop(command);
        drop(extra);

        let pid = child.id();
        let id = event_loop.allocate_id();
        let core = Rc::new(ProcessCore {
            id,
            pid,
            event_loop: event_loop.downgrade(),
            state: RefCell::new(ProcessState {
                exit_status: None,
                term_signal: None,
                exit_callback,
                closing: false,
                close_callback: None,
            }),
        });

        let waiter = thread::Builder::new()
            .name(format!("handoff-wait-{}", pid))
            .spawn(move || {
                let status = child.wait();
                notifier.notify(ExitNotice { id, status });
            });
        if let Err(e) = waiter {
            error!(pid, "Failed to start waiter thread: {}", e);
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            return Err(spawn_error(e));
        }
        event_loop.track_process(id, core.clone());

        for (pipe, fd) in parent_ends {
            if let Err(e) = pipe.open(fd) {
                warn!(pid, "Could not open parent end of stdio pipe: {}", e);
            }
        }

        debug!(pid, file = %file.display(), "Spawned process");
        Ok(Process { core })
    }

    pub fn pid(&self) -> u32 {
        self.core.pid
    }

    /// Send `signum` to the child; 0 only checks that it still exists
    pub fn kill(&self, signum: i32) -> RuntimeResult<()> {
        {
            let st = self.core.state.borrow();
            if st.closing {
                return Err(RuntimeError::closing("kill"));
            }
            if st.exit_status.is_some() {
                return Err(RuntimeError::InvalidState(
                    "process has already exited".to_string(),
                ));
            }
        }
        let pid = Pid::from_raw(self.core.pid as i32);
        if signum == 0 {
            signal::kill(pid, None::<Signal>)?;
        } else {
            signal::kill(pid, Signal::try_from(signum)?)?;
        }
        debug!(pid = self.core.pid, signum, "Signalled process");
        Ok(())
    }

    /// Exit code, once the exit callback has run
    pub fn exit_status(&self) -> Option<i64> {
        self.core.state.borrow().exit_status
    }

    /// Terminating signal (0 for a normal exit), once the exit callback has run
    pub fn term_signal(&self) -> Option<i32> {
        self.core.state.borrow().term_signal
    }
}

/// Record the exit and run the exit callback, even on a closing handle
pub(crate) fn deliver_exit(core: Rc<ProcessCore>, status: io::Result<ExitStatus>) {
    let (exit_status, term_signal) = match status {
        Ok(status) => match (status.code(), status.signal()) {
            (Some(code), _) => (i64::from(code), 0),
            (None, Some(signal)) => (0, signal),
            (None, None) => (0, 0),
        },
        Err(e) => {
            error!(pid = core.pid, "Waiting for process failed: {}", e);
            (-1, 0)
        }
    };

    let callback = {
        let mut st = core.state.borrow_mut();
        st.exit_status = Some(exit_status);
        st.term_signal = Some(term_signal);
        st.exit_callback.take()
    };
    debug!(pid = core.pid, exit_status, term_signal, "Process exited");
    if let Some(callback) = callback {
        callback(&Process { core }, exit_status, term_signal);
    }
}

impl Source for ProcessCore {
    fn id(&self) -> u64 {
        self.id
    }

    fn interest(&self) -> Option<(RawFd, PollFlags)> {
        None
    }

    fn dispatch(self: Rc<Self>, _revents: PollFlags) {}

    fn is_active(&self) -> bool {
        self.state.borrow().exit_status.is_none()
    }

    fn finish_close(self: Rc<Self>) {
        let callback = self.state.borrow_mut().close_callback.take();
        debug!(pid = self.pid, "Process handle closed");
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Handle for Process {
    fn kind(&self) -> HandleKind {
        HandleKind::Process
    }

    fn is_active(&self) -> bool {
        Source::is_active(&*self.core)
    }

    fn is_closing(&self) -> bool {
        self.core.state.borrow().closing
    }

    fn request_close(&self, callback: Option<CloseCallback>) {
        {
            let mut st = self.core.state.borrow_mut();
            if st.closing {
                warn!(pid = self.core.pid, "Close requested twice; ignoring");
                return;
            }
            st.closing = true;
            st.close_callback = callback;
        }
        let source: Rc<dyn Source> = self.core.clone();
        match self.core.event_loop.upgrade() {
            Ok(event_loop) => event_loop.schedule_close(source),
            Err(_) => source.finish_close(),
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.core.state.borrow();
        f.debug_struct("Process")
            .field("pid", &self.core.pid)
            .field("exit_status", &st.exit_status)
            .field("term_signal", &st.term_signal)
            .field("closing", &st.closing)
            .finish()
    }
}
