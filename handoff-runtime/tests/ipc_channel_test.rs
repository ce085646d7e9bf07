use bytes::Bytes;
use handoff_config::HandoffConfig;
use handoff_ipc::{encode_frame, send_with_fd, IpcError, TransferKind};
use handoff_runtime::{
    EventLoop, Handle, HandleKind, Pipe, RuntimeError, Stream, StreamRole, Tcp, Udp,
};
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

type Events = Rc<RefCell<Vec<(Result<Bytes, String>, Option<HandleKind>)>>>;

/// Handles created inside callbacks; the loop does not own them
type Keep = Rc<RefCell<Vec<Box<dyn Handle>>>>;

fn keeper() -> Keep {
    Rc::new(RefCell::new(Vec::new()))
}

fn loopback() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

/// Two connected IPC channels on the same loop
fn channel_pair(event_loop: &EventLoop) -> (Pipe, Pipe) {
    let (a, b) = UnixStream::pair().expect("Failed to create socket pair");
    let left = Pipe::new(event_loop, true);
    let right = Pipe::new(event_loop, true);
    left.open(OwnedFd::from(a)).expect("Failed to open left end");
    right.open(OwnedFd::from(b)).expect("Failed to open right end");
    (left, right)
}

/// An IPC channel on the loop whose peer is a plain blocking socket
fn raw_peer(event_loop: &EventLoop) -> (Pipe, UnixStream) {
    let (a, b) = UnixStream::pair().expect("Failed to create socket pair");
    let channel = Pipe::new(event_loop, true);
    channel.open(OwnedFd::from(a)).expect("Failed to open channel");
    (channel, b)
}

/// Record every read event and close the channel on the first error
fn record_reads(channel: &Pipe) -> Events {
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    channel
        .start_read(move |stream, result| {
            let failed = result.is_err();
            sink.borrow_mut().push((
                result.map_err(|e| e.to_string()),
                stream.pending_handle_type(),
            ));
            if failed {
                stream.close();
            }
        })
        .expect("Failed to start reading");
    events
}

/// Everything the peer sends until it closes; fails instead of hanging when
/// a descriptor copy leaks
fn read_until_closed(mut socket: UnixStream) -> Vec<u8> {
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("Failed to set read timeout");
    let mut buf = Vec::new();
    socket.read_to_end(&mut buf).expect("Failed to read to end");
    buf
}

#[test]
fn test_transfer_tcp_listener() {
    let event_loop = EventLoop::new().unwrap();
    let (sender, receiver) = channel_pair(&event_loop);

    let listener = Tcp::new(&event_loop);
    listener.bind(loopback()).unwrap();
    let addr = listener.getsockname().unwrap();
    sender
        .write_with_handle(b"listener", &listener, |_, r| r.unwrap())
        .unwrap();
    // The write owns its own duplicate
    listener.close();

    let client: Rc<RefCell<Option<TcpStream>>> = Rc::new(RefCell::new(None));
    let deliveries = Rc::new(Cell::new(0));

    let keep = keeper();
    let lp = event_loop.clone();
    let client_slot = client.clone();
    let count = deliveries.clone();
    receiver
        .start_read(move |channel, result| {
            count.set(count.get() + 1);
            assert_eq!(&result.unwrap()[..], b"listener");
            assert_eq!(channel.pending_handle_type(), Some(HandleKind::Tcp));

            let server = Tcp::new(&lp);
            channel.accept(&server).unwrap();
            assert_eq!(channel.pending_handle_type(), None);
            assert_eq!(server.getsockname().unwrap(), addr);

            let inner_lp = lp.clone();
            let inner_keep = keep.clone();
            server
                .listen(12, move |srv, result| {
                    result.unwrap();
                    let conn = Tcp::new(&inner_lp);
                    srv.accept(&conn).unwrap();
                    srv.close();
                    conn.write(b"hi", |s, r| {
                        r.unwrap();
                        s.close();
                    })
                    .unwrap();
                    inner_keep.borrow_mut().push(Box::new(conn));
                })
                .unwrap();
            keep.borrow_mut().push(Box::new(server));
            *client_slot.borrow_mut() = Some(TcpStream::connect(addr).unwrap());
            channel.close();
        })
        .unwrap();

    event_loop.run().unwrap();
    assert_eq!(deliveries.get(), 1);

    let mut client = client.borrow_mut().take().unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).unwrap();
    assert_eq!(reply, b"hi");
}

#[test]
fn test_transfer_udp_socket() {
    let event_loop = EventLoop::new().unwrap();
    let (sender, receiver) = channel_pair(&event_loop);

    let udp = Udp::new(&event_loop);
    udp.bind(loopback()).unwrap();
    let addr = udp.getsockname().unwrap();
    sender.write_with_handle(b"udp", &udp, |_, r| r.unwrap()).unwrap();
    udp.close();

    let received = Rc::new(RefCell::new(Vec::new()));
    let keep = keeper();
    let lp = event_loop.clone();
    let sink = received.clone();
    receiver
        .start_read(move |channel, result| {
            result.unwrap();
            assert_eq!(channel.pending_handle_type(), Some(HandleKind::Udp));
            let adopted = Udp::new(&lp);
            channel.accept(&adopted).unwrap();
            assert_eq!(adopted.getsockname().unwrap(), addr);

            let sink = sink.clone();
            adopted
                .start_recv(move |socket, result| {
                    let (data, _) = result.unwrap();
                    sink.borrow_mut().extend_from_slice(&data);
                    socket.close();
                })
                .unwrap();
            UdpSocket::bind(loopback())
                .unwrap()
                .send_to(b"ping", addr)
                .unwrap();
            keep.borrow_mut().push(Box::new(adopted));
            channel.close();
        })
        .unwrap();

    event_loop.run().unwrap();
    assert_eq!(&received.borrow()[..], b"ping");
}

#[test]
fn test_transfer_pipe() {
    let event_loop = EventLoop::new().unwrap();
    let (sender, receiver) = channel_pair(&event_loop);

    let (ours, theirs) = UnixStream::pair().unwrap();
    let pipe = Pipe::new(&event_loop, false);
    pipe.open(OwnedFd::from(ours)).unwrap();
    sender.write_with_handle(b"pipe", &pipe, |_, r| r.unwrap()).unwrap();
    pipe.close();

    let keep = keeper();
    let lp = event_loop.clone();
    receiver
        .start_read(move |channel, result| {
            result.unwrap();
            assert_eq!(channel.pending_handle_type(), Some(HandleKind::NamedPipe));
            let adopted = Pipe::new(&lp, false);
            channel.accept(&adopted).unwrap();
            assert!(!adopted.is_ipc());
            adopted
                .write(b"over the wire", |s, r| {
                    r.unwrap();
                    s.close();
                })
                .unwrap();
            keep.borrow_mut().push(Box::new(adopted));
            channel.close();
        })
        .unwrap();

    event_loop.run().unwrap();
    assert_eq!(read_until_closed(theirs), b"over the wire");
}

#[test]
fn test_accept_errors_leave_pending_handle() {
    let event_loop = EventLoop::new().unwrap();
    let (sender, receiver) = channel_pair(&event_loop);

    let listener = Tcp::new(&event_loop);
    listener.bind(loopback()).unwrap();
    sender.write(b"plain", |_, r| r.unwrap()).unwrap();
    sender
        .write_with_handle(b"with handle", &listener, |_, r| r.unwrap())
        .unwrap();
    listener.close();

    let frames = Rc::new(Cell::new(0));
    let lp = event_loop.clone();
    let seen = frames.clone();
    receiver
        .start_read(move |channel, result| {
            let payload = result.unwrap();
            seen.set(seen.get() + 1);

            if &payload[..] == b"plain" {
                assert_eq!(channel.pending_handle_type(), None);
                let target = Tcp::new(&lp);
                assert!(matches!(
                    channel.accept(&target),
                    Err(RuntimeError::InvalidHandleTransfer(_))
                ));
                assert!(!target.is_active());
                assert!(target.getsockname().is_err());
                return;
            }

            assert_eq!(&payload[..], b"with handle");
            let wrong_kind = Udp::new(&lp);
            assert!(matches!(
                channel.accept(&wrong_kind),
                Err(RuntimeError::InvalidHandleTransfer(_))
            ));
            let as_pipe = Pipe::new(&lp, false);
            assert!(matches!(
                channel.accept(&as_pipe),
                Err(RuntimeError::InvalidHandleTransfer(_))
            ));
            let not_fresh = Tcp::new(&lp);
            not_fresh.bind(loopback()).unwrap();
            assert!(matches!(
                channel.accept(&not_fresh),
                Err(RuntimeError::InvalidHandleTransfer(_))
            ));
            let closing = Tcp::new(&lp);
            closing.close();
            assert!(matches!(
                channel.accept(&closing),
                Err(RuntimeError::InvalidHandleTransfer(_))
            ));

            // Still there after every failed attempt
            assert_eq!(channel.pending_handle_type(), Some(HandleKind::Tcp));
            let target = Tcp::new(&lp);
            channel.accept(&target).unwrap();
            assert!(target.getsockname().is_ok());
            assert!(matches!(
                channel.accept(&Tcp::new(&lp)),
                Err(RuntimeError::InvalidHandleTransfer(_))
            ));

            not_fresh.close();
            target.close();
            channel.close();
        })
        .unwrap();

    event_loop.run().unwrap();
    assert_eq!(frames.get(), 2);
}

#[test]
fn test_handle_on_plain_pipe_is_unsupported() {
    let event_loop = EventLoop::new().unwrap();
    let (ours, theirs) = UnixStream::pair().unwrap();
    let pipe = Pipe::new(&event_loop, false);
    pipe.open(OwnedFd::from(ours)).unwrap();

    let listener = Tcp::new(&event_loop);
    listener.bind(loopback()).unwrap();
    let called = Rc::new(Cell::new(false));
    let flag = called.clone();
    let result = pipe.write_with_handle(b"hello", &listener, move |_, _| flag.set(true));
    assert!(matches!(result, Err(RuntimeError::UnsupportedOperation(_))));

    assert!(matches!(
        pipe.accept(&Tcp::new(&event_loop)),
        Err(RuntimeError::UnsupportedOperation(_))
    ));

    pipe.close();
    listener.close();
    event_loop.run().unwrap();
    assert!(!called.get());

    assert!(read_until_closed(theirs).is_empty());
}

#[test]
fn test_unaccepted_handle_is_released() {
    let event_loop = EventLoop::new().unwrap();
    let (sender, receiver) = channel_pair(&event_loop);

    let (ours, theirs) = UnixStream::pair().unwrap();
    let pipe = Pipe::new(&event_loop, false);
    pipe.open(OwnedFd::from(ours)).unwrap();
    sender.write_with_handle(b"ignored", &pipe, |_, r| r.unwrap()).unwrap();
    pipe.close();
    sender.write(b"next", |_, r| r.unwrap()).unwrap();

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    receiver
        .start_read(move |channel, result| {
            let payload = result.unwrap();
            sink.borrow_mut()
                .push((payload.clone(), channel.pending_handle_type()));
            if &payload[..] == b"next" {
                channel.close();
            }
        })
        .unwrap();

    event_loop.run().unwrap();
    assert_eq!(
        *events.borrow(),
        vec![
            (Bytes::from_static(b"ignored"), Some(HandleKind::NamedPipe)),
            (Bytes::from_static(b"next"), None),
        ]
    );

    // Every copy of the far end is gone, so the peer sees end of stream
    assert!(read_until_closed(theirs).is_empty());
}

#[test]
fn test_local_close_while_pending() {
    let event_loop = EventLoop::new().unwrap();
    let (sender, receiver) = channel_pair(&event_loop);

    let (ours, theirs) = UnixStream::pair().unwrap();
    let pipe = Pipe::new(&event_loop, false);
    pipe.open(OwnedFd::from(ours)).unwrap();
    sender.write_with_handle(b"first", &pipe, |_, r| r.unwrap()).unwrap();
    sender.write(b"never seen", |_, r| r.unwrap()).unwrap();
    pipe.close();

    let deliveries = Rc::new(Cell::new(0));
    let count = deliveries.clone();
    receiver
        .start_read(move |channel, result| {
            result.unwrap();
            count.set(count.get() + 1);
            assert!(channel.pending_handle_type().is_some());
            channel.close();
            assert!(channel.is_closing());
        })
        .unwrap();

    event_loop.run().unwrap();
    assert_eq!(deliveries.get(), 1);

    assert!(read_until_closed(theirs).is_empty());
}

#[test]
fn test_truncated_frame_with_descriptor_ends_stream() {
    let event_loop = EventLoop::new().unwrap();
    let (channel, peer) = raw_peer(&event_loop);

    let (carried, _far_end) = UnixStream::pair().unwrap();
    let frame = encode_frame(b"0123456789", Some(TransferKind::NamedPipe), 1024).unwrap();
    let sent = send_with_fd(peer.as_fd(), &frame[..8], Some(carried.as_fd())).unwrap();
    assert_eq!(sent, 8);
    drop(peer);

    let events = record_reads(&channel);
    event_loop.run().unwrap();

    let events = events.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, Err(RuntimeError::EndOfStream.to_string()));
    assert_eq!(events[0].1, None);
}

#[test]
fn test_header_without_descriptor_is_protocol_error() {
    let event_loop = EventLoop::new().unwrap();
    let (channel, mut peer) = raw_peer(&event_loop);

    let frame = encode_frame(b"abc", Some(TransferKind::Tcp), 1024).unwrap();
    peer.write_all(&frame).unwrap();

    let seen = Rc::new(RefCell::new(None));
    let slot = seen.clone();
    channel
        .start_read(move |stream, result| {
            *slot.borrow_mut() = Some(result);
            stream.close();
        })
        .unwrap();
    event_loop.run().unwrap();

    let result = seen.borrow_mut().take().unwrap();
    assert!(matches!(
        result,
        Err(RuntimeError::Ipc(IpcError::MissingDescriptor(TransferKind::Tcp)))
    ));
}

#[test]
fn test_peer_close_delivers_end_of_stream_once() {
    let event_loop = EventLoop::new().unwrap();
    let (channel, mut peer) = raw_peer(&event_loop);

    peer.write_all(&encode_frame(b"last words", None, 1024).unwrap())
        .unwrap();
    drop(peer);

    let events = record_reads(&channel);
    event_loop.run().unwrap();

    let events = events.borrow();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], (Ok(Bytes::from_static(b"last words")), None));
    assert_eq!(events[1].0, Err(RuntimeError::EndOfStream.to_string()));
}

#[test]
fn test_back_to_back_frames_including_empty() {
    let event_loop = EventLoop::new().unwrap();
    let (channel, mut peer) = raw_peer(&event_loop);

    let mut wire = Vec::new();
    wire.extend_from_slice(&encode_frame(b"one", None, 1024).unwrap());
    wire.extend_from_slice(&encode_frame(b"", None, 1024).unwrap());
    wire.extend_from_slice(&encode_frame(b"three", None, 1024).unwrap());
    // One byte per write
    for byte in &wire {
        peer.write_all(std::slice::from_ref(byte)).unwrap();
    }
    drop(peer);

    let events = record_reads(&channel);
    event_loop.run().unwrap();

    let payloads: Vec<_> = events
        .borrow()
        .iter()
        .filter_map(|(result, _)| result.clone().ok())
        .collect();
    assert_eq!(
        payloads,
        vec![
            Bytes::from_static(b"one"),
            Bytes::new(),
            Bytes::from_static(b"three"),
        ]
    );
}

#[test]
fn test_oversized_frame_rejected_by_writer() {
    let mut config = HandoffConfig::default();
    config.ipc.max_frame_len = 16;
    let event_loop = EventLoop::from_config(&config).unwrap();
    let (sender, _receiver) = channel_pair(&event_loop);

    let result = sender.write(&[0u8; 17], |_, _| panic!("write callback must not run"));
    assert!(matches!(
        result,
        Err(RuntimeError::Ipc(IpcError::FrameTooLarge { len: 17, max: 16 }))
    ));
    sender.write(&[0u8; 16], |_, r| r.unwrap()).unwrap();
    event_loop.run().unwrap();
}

#[test]
fn test_operations_after_close() {
    let event_loop = EventLoop::new().unwrap();
    let (sender, receiver) = channel_pair(&event_loop);

    let closes = Rc::new(Cell::new(0));
    let count = closes.clone();
    sender.close_with(move || count.set(count.get() + 1));
    // Ignored
    sender.close();

    assert!(matches!(
        sender.write(b"late", |_, _| {}),
        Err(RuntimeError::InvalidState(_))
    ));
    assert!(matches!(
        sender.start_read(|_, _| {}),
        Err(RuntimeError::InvalidState(_))
    ));

    let events = record_reads(&receiver);
    event_loop.run().unwrap();

    assert_eq!(closes.get(), 1);
    let events = events.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, Err(RuntimeError::EndOfStream.to_string()));
}

#[test]
fn test_write_callbacks_run_in_order() {
    let event_loop = EventLoop::new().unwrap();
    let (sender, receiver) = channel_pair(&event_loop);

    let order = Rc::new(RefCell::new(Vec::new()));
    for i in 0..5 {
        let order = order.clone();
        sender
            .write(format!("frame {}", i).as_bytes(), move |_: &Stream, r| {
                r.unwrap();
                order.borrow_mut().push(i);
            })
            .unwrap();
    }
    sender
        .shutdown(|_, r| r.unwrap())
        .unwrap();

    let events = record_reads(&receiver);
    event_loop.run().unwrap();

    assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    let events = events.borrow();
    assert_eq!(events.len(), 6);
    assert_eq!(events[4].0, Ok(Bytes::from_static(b"frame 4")));
    assert_eq!(events[5].0, Err(RuntimeError::EndOfStream.to_string()));
}

#[test]
fn test_unknown_connection_accepted_by_socket_family() {
    let event_loop = EventLoop::new().unwrap();
    let (channel, peer) = raw_peer(&event_loop);

    let listener = std::net::TcpListener::bind(loopback()).unwrap();
    let listener_addr = listener.local_addr().unwrap();
    let tcp_conn = TcpStream::connect(listener_addr).unwrap();
    let (unix_conn, far_end) = UnixStream::pair().unwrap();

    let frame = encode_frame(b"tcp", Some(TransferKind::Unknown), 1024).unwrap();
    send_with_fd(peer.as_fd(), &frame, Some(tcp_conn.as_fd())).unwrap();
    let frame = encode_frame(b"unix", Some(TransferKind::Unknown), 1024).unwrap();
    send_with_fd(peer.as_fd(), &frame, Some(unix_conn.as_fd())).unwrap();
    drop(tcp_conn);
    drop(unix_conn);

    let tcp_peer: Rc<Cell<Option<SocketAddr>>> = Rc::new(Cell::new(None));
    let keep = keeper();
    let lp = event_loop.clone();
    let peer_slot = tcp_peer.clone();
    channel
        .start_read(move |channel, result| {
            let payload = result.unwrap();
            assert_eq!(channel.pending_handle_type(), Some(HandleKind::Unknown));

            if &payload[..] == b"tcp" {
                assert!(matches!(
                    channel.accept(&Pipe::new(&lp, false)),
                    Err(RuntimeError::InvalidHandleTransfer(_))
                ));
                assert!(matches!(
                    channel.accept(&Udp::new(&lp)),
                    Err(RuntimeError::InvalidHandleTransfer(_))
                ));
                let conn = Tcp::new(&lp);
                channel.accept(&conn).unwrap();
                assert_eq!(conn.role(), StreamRole::Open);
                peer_slot.set(conn.getpeername().ok());
                conn.close();
                return;
            }

            assert_eq!(&payload[..], b"unix");
            assert!(matches!(
                channel.accept(&Tcp::new(&lp)),
                Err(RuntimeError::InvalidHandleTransfer(_))
            ));
            let pipe = Pipe::new(&lp, false);
            channel.accept(&pipe).unwrap();
            assert_eq!(pipe.role(), StreamRole::Open);
            pipe.write(b"relayed", |s, r| {
                r.unwrap();
                s.close();
            })
            .unwrap();
            keep.borrow_mut().push(Box::new(pipe));
            channel.close();
        })
        .unwrap();

    event_loop.run().unwrap();
    assert_eq!(tcp_peer.get(), Some(listener_addr));
    assert_eq!(read_until_closed(far_end), b"relayed");
}

#[test]
fn test_handle_write_to_closed_peer_reports_error() {
    let event_loop = EventLoop::new().unwrap();
    let (channel, peer) = raw_peer(&event_loop);
    drop(peer);

    let listener = Tcp::new(&event_loop);
    listener.bind(loopback()).unwrap();
    let outcome = Rc::new(RefCell::new(None));
    let slot = outcome.clone();
    channel
        .write_with_handle(b"listener", &listener, move |_, result| {
            *slot.borrow_mut() = Some(result);
        })
        .unwrap();
    listener.close();

    event_loop.run().unwrap();
    let result = outcome.borrow_mut().take().expect("write callback did not run");
    match result {
        Err(RuntimeError::Io(e)) => assert_eq!(e.raw_os_error(), Some(nix::libc::EPIPE)),
        other => panic!("expected EPIPE, got {:?}", other),
    }

    channel.close();
    event_loop.run().unwrap();
}
