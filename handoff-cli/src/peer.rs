//! Child-side programs driven over the IPC channel

use anyhow::{Context, Result};
use handoff_runtime::{
    EventLoop, Handle, HandleKind, Pipe, RuntimeResult, Stream, Tcp, Transferable, Udp,
};
use std::net::{Ipv4Addr, SocketAddr};
use tracing::{debug, error, info, warn};

use crate::cli::Mode;

const BACKLOG: i32 = 12;

/// Set up `mode` on `channel` and run the loop to completion
pub fn run(mode: &Mode, event_loop: &EventLoop, channel: &Pipe) -> Result<()> {
    match *mode {
        Mode::ListenBeforeWrite { port } => serve_one_connection(event_loop, channel, port, true),
        Mode::ListenAfterWrite { port } => serve_one_connection(event_loop, channel, port, false),
        Mode::Echo => echo(event_loop, channel),
        Mode::Hello => hello(event_loop, channel),
    }
}

fn close_if_open(handle: &dyn Handle) {
    if !handle.is_closing() {
        handle.close();
    }
}

/// Write callback that closes the channel once the frame is out
fn close_after_write(what: &'static str) -> impl FnOnce(&Stream, RuntimeResult<()>) {
    move |channel, result| {
        match result {
            Ok(()) => debug!("Sent {}", what),
            Err(e) => warn!("Failed to send {}: {}", what, e),
        }
        close_if_open(channel);
    }
}

/// Share a TCP server with the parent and hand back the first connection we
/// accept on it.
fn serve_one_connection(
    event_loop: &EventLoop,
    channel: &Pipe,
    port: u16,
    listen_first: bool,
) -> Result<()> {
    let server = Tcp::new(event_loop);
    server
        .bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        .context("Failed to bind TCP server")?;
    info!(addr = %server.getsockname()?, listen_first, "Bound TCP server");

    if listen_first {
        listen_once(event_loop, &server, channel)?;
    }
    channel
        .write_with_handle(b"hello", &server, |_, result| match result {
            Ok(()) => debug!("Sent server to parent"),
            Err(e) => warn!("Failed to send server: {}", e),
        })
        .context("Failed to send server")?;
    if !listen_first {
        listen_once(event_loop, &server, channel)?;
    }

    // Stop everything if the parent goes away first
    let server_ref = server.clone();
    channel.start_read(move |ch, result| match result {
        Ok(payload) => debug!(bytes = payload.len(), "Parent says {:?}", String::from_utf8_lossy(&payload)),
        Err(e) => {
            if !e.is_end_of_stream() {
                warn!("Channel read failed: {}", e);
            }
            close_if_open(&server_ref);
            close_if_open(ch);
        }
    })?;

    event_loop.run()?;
    Ok(())
}

fn listen_once(event_loop: &EventLoop, server: &Tcp, channel: &Pipe) -> Result<()> {
    let lp = event_loop.clone();
    let channel = channel.clone();
    server
        .listen(BACKLOG, move |srv, result| {
            if let Err(e) = result {
                warn!("Incoming connection failed: {}", e);
                return;
            }
            let conn = Tcp::new(&lp);
            if let Err(e) = srv.accept(&conn) {
                error!("Failed to accept connection: {}", e);
                return;
            }
            srv.close();
            info!(peer = ?conn.getpeername().ok(), "Accepted connection");

            if let Err(e) = channel.write_with_handle(
                b"accepted_connection",
                &conn,
                close_after_write("accepted connection"),
            ) {
                error!("Failed to send accepted connection: {}", e);
                close_if_open(&channel);
            }
            conn.close();
        })
        .context("Failed to listen")?;
    Ok(())
}

fn fresh_handle(event_loop: &EventLoop, kind: HandleKind) -> Option<Box<dyn Transferable>> {
    match kind {
        HandleKind::Tcp => Some(Box::new(Tcp::new(event_loop))),
        HandleKind::Udp => Some(Box::new(Udp::new(event_loop))),
        HandleKind::NamedPipe => Some(Box::new(Pipe::new(event_loop, false))),
        HandleKind::Process | HandleKind::Unknown => None,
    }
}

/// Accept the first handle the parent sends and send it back
fn echo(event_loop: &EventLoop, channel: &Pipe) -> Result<()> {
    let lp = event_loop.clone();
    channel.start_read(move |ch, result| {
        let payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                if !e.is_end_of_stream() {
                    warn!("Channel read failed: {}", e);
                }
                close_if_open(ch);
                return;
            }
        };
        let Some(kind) = ch.pending_handle_type() else {
            debug!(bytes = payload.len(), "Frame without handle; ignoring");
            return;
        };
        let Some(handle) = fresh_handle(&lp, kind) else {
            warn!(%kind, "Cannot echo a handle of this kind");
            return;
        };

        if let Err(e) = ch.accept(handle.as_ref()) {
            error!(%kind, "Failed to accept handle: {}", e);
            close_if_open(ch);
            return;
        }
        info!(%kind, "Echoing handle");
        if let Err(e) = ch.write_with_handle(b".", handle.as_ref(), close_after_write("echo")) {
            error!("Failed to echo handle: {}", e);
            close_if_open(ch);
        }
        handle.close();
    })?;

    event_loop.run()?;
    Ok(())
}

fn hello(event_loop: &EventLoop, channel: &Pipe) -> Result<()> {
    channel.start_read(|ch, result| match result {
        Ok(payload) if &payload[..] == b"hello" => {
            if let Err(e) = ch.write(b"world", close_after_write("world")) {
                error!("Failed to answer: {}", e);
                close_if_open(ch);
            }
        }
        Ok(payload) => debug!(bytes = payload.len(), "Unexpected frame; ignoring"),
        Err(e) => {
            if !e.is_end_of_stream() {
                warn!("Channel read failed: {}", e);
            }
            close_if_open(ch);
        }
    })?;

    event_loop.run()?;
    Ok(())
}
