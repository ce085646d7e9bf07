//! TCP streams

use std::net::SocketAddr;

use crate::error::RuntimeResult;
use crate::event_loop::EventLoop;
use crate::stream::{delegate_stream_handle, Stream, StreamKind};
use crate::sys;

/// A TCP socket: listener or connection
#[derive(Clone, Debug)]
pub struct Tcp {
    stream: Stream,
}

impl Tcp {
    pub fn new(event_loop: &EventLoop) -> Self {
        Self {
            stream: Stream::new(event_loop, StreamKind::Tcp, false),
        }
    }

    /// Bind to `addr` with `SO_REUSEADDR`; port 0 picks a free port
    pub fn bind(&self, addr: SocketAddr) -> RuntimeResult<()> {
        let fd = sys::stream_socket(sys::inet_family(&addr))?;
        sys::bind_inet(&fd, addr)?;
        self.stream.install_bound(fd, None)
    }

    pub fn connect<F>(&self, addr: SocketAddr, callback: F) -> RuntimeResult<()>
    where
        F: FnOnce(&Stream, RuntimeResult<()>) + 'static,
    {
        self.stream.start_connect(
            || sys::stream_socket(sys::inet_family(&addr)),
            |fd| sys::connect_inet(fd, addr),
            Box::new(callback),
        )
    }

    pub fn getsockname(&self) -> RuntimeResult<SocketAddr> {
        self.stream.with_fd(sys::local_addr)
    }

    pub fn getpeername(&self) -> RuntimeResult<SocketAddr> {
        self.stream.with_fd(sys::peer_addr)
    }

    pub fn set_nodelay(&self, enable: bool) -> RuntimeResult<()> {
        self.stream.with_fd(|fd| sys::set_nodelay(fd, enable))
    }
}

delegate_stream_handle!(Tcp);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::private::{Endpoint, Origin};
    use crate::handle::{Handle, HandleKind, Transferable};
    use crate::stream::StreamRole;
    use crate::RuntimeError;
    use handoff_ipc::TransferKind;
    use std::cell::RefCell;
    use std::io;
    use std::net::{Ipv4Addr, TcpListener};
    use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
    use std::rc::Rc;

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn test_bind_reports_address() {
        let event_loop = EventLoop::new().unwrap();
        let tcp = Tcp::new(&event_loop);
        assert_eq!(tcp.kind(), HandleKind::Tcp);
        assert!(matches!(tcp.getsockname(), Err(RuntimeError::InvalidState(_))));

        tcp.bind(loopback()).unwrap();
        let addr = tcp.getsockname().unwrap();
        assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(addr.port(), 0);
        assert!(tcp.getpeername().is_err());

        assert!(matches!(
            tcp.bind(loopback()),
            Err(RuntimeError::InvalidState(_))
        ));
    }

    #[test]
    fn test_listen_requires_bind() {
        let event_loop = EventLoop::new().unwrap();
        let tcp = Tcp::new(&event_loop);
        let result = tcp.listen(12, |_, _| {});
        assert!(matches!(result, Err(RuntimeError::InvalidState(_))));
    }

    #[test]
    fn test_connect_write_and_read_back() {
        let event_loop = EventLoop::new().unwrap();
        let server = Tcp::new(&event_loop);
        server.bind(loopback()).unwrap();
        let addr = server.getsockname().unwrap();

        // Server echoes the first chunk and closes
        let conn = Tcp::new(&event_loop);
        let conn_slot = conn.clone();
        let server_slot = server.clone();
        server
            .listen(12, move |listener, result| {
                result.unwrap();
                listener.accept(&conn_slot).unwrap();
                server_slot.close();
                conn_slot
                    .start_read(|stream, chunk| {
                        let chunk = chunk.unwrap();
                        stream.write(&chunk, |s, r| {
                            r.unwrap();
                            s.close();
                        })
                        .unwrap();
                    })
                    .unwrap();
            })
            .unwrap();
        assert!(server.is_active());

        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        let client = Tcp::new(&event_loop);
        client
            .connect(addr, move |stream, result| {
                result.unwrap();
                stream.write(b"ping", |_, r| r.unwrap()).unwrap();
                stream
                    .start_read(move |s, chunk| match chunk {
                        Ok(bytes) => sink.borrow_mut().extend_from_slice(&bytes),
                        Err(e) => {
                            assert!(e.is_end_of_stream());
                            s.close();
                        }
                    })
                    .unwrap();
            })
            .unwrap();
        assert_eq!(client.role(), StreamRole::Connecting);

        event_loop.run().unwrap();
        assert_eq!(&received.borrow()[..], b"ping");
        assert_eq!(client.getpeername().ok(), None);
    }

    #[test]
    fn test_connect_refused() {
        // Grab a free port and release it so nothing listens there
        let port = TcpListener::bind(loopback()).unwrap().local_addr().unwrap().port();
        let event_loop = EventLoop::new().unwrap();
        let outcome = Rc::new(RefCell::new(None));

        let slot = outcome.clone();
        let client = Tcp::new(&event_loop);
        client
            .connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), move |_, result| {
                *slot.borrow_mut() = Some(result);
            })
            .unwrap();
        event_loop.run().unwrap();

        let result = outcome.borrow_mut().take().unwrap();
        assert!(matches!(result, Err(RuntimeError::Io(_))));
        assert_eq!(client.role(), StreamRole::Unbound);
    }

    #[test]
    fn test_nodelay_on_connected_socket() {
        let listener = TcpListener::bind(loopback()).unwrap();
        let event_loop = EventLoop::new().unwrap();
        let client = Tcp::new(&event_loop);
        client
            .connect(listener.local_addr().unwrap(), |stream, result| {
                result.unwrap();
                stream.close();
            })
            .unwrap();
        client.set_nodelay(true).unwrap();
        event_loop.run().unwrap();
    }

    /// Accept target that vets fine but cannot take the descriptor
    struct BrokenTarget;

    impl Handle for BrokenTarget {
        fn kind(&self) -> HandleKind {
            HandleKind::Tcp
        }

        fn is_active(&self) -> bool {
            false
        }

        fn is_closing(&self) -> bool {
            false
        }

        fn request_close(&self, _callback: Option<crate::CloseCallback>) {}
    }

    impl Endpoint for BrokenTarget {
        fn export(&self) -> RuntimeResult<(TransferKind, OwnedFd)> {
            Err(RuntimeError::InvalidState("nothing to send".to_string()))
        }

        fn check_adopt(&self, _kind: TransferKind, _fd: BorrowedFd<'_>) -> RuntimeResult<()> {
            Ok(())
        }

        fn adopt(&self, _fd: OwnedFd, _origin: Origin) -> RuntimeResult<()> {
            Err(RuntimeError::Io(io::Error::from(io::ErrorKind::PermissionDenied)))
        }
    }

    impl Transferable for BrokenTarget {}

    #[test]
    fn test_accept_reports_adopt_failure() {
        let event_loop = EventLoop::new().unwrap();
        let server = Tcp::new(&event_loop);
        server.bind(loopback()).unwrap();
        let addr = server.getsockname().unwrap();

        let outcome = Rc::new(RefCell::new(None));
        let slot = outcome.clone();
        server
            .listen(12, move |listener, result| {
                result.unwrap();
                *slot.borrow_mut() = Some(listener.accept(&BrokenTarget));
                listener.close();
            })
            .unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();
        event_loop.run().unwrap();

        let result = outcome.borrow_mut().take().unwrap();
        match result {
            Err(RuntimeError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("expected adopt error, got {:?}", other),
        }
    }

    #[test]
    fn test_accept_error_disarms_listener() {
        let event_loop = EventLoop::new().unwrap();
        let server = Tcp::new(&event_loop);
        server.bind(loopback()).unwrap();

        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = errors.clone();
        server
            .listen(12, move |_, result| {
                sink.borrow_mut().push(result.map_err(|e| e.raw_os_error()));
            })
            .unwrap();

        // A listener shut down for reading polls readable, yet accept fails
        // with EINVAL every time
        server
            .stream
            .with_fd(|fd| {
                nix::sys::socket::shutdown(fd.as_raw_fd(), nix::sys::socket::Shutdown::Read)?;
                Ok(())
            })
            .unwrap();
        event_loop.run().unwrap();

        assert_eq!(
            *errors.borrow(),
            vec![Err(Some(nix::errno::Errno::EINVAL as i32))]
        );
        assert_eq!(server.role(), StreamRole::Bound);
        assert!(!server.is_active());
        server.close();
        event_loop.run().unwrap();
    }
}
