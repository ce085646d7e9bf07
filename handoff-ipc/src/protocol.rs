//! IPC frame format
//!
//! ```text
//! +-----+-----------------+------------------+
//! | tag | length (u32 BE) | payload (length) |
//! +-----+-----------------+------------------+
//! ```
//!
//! `tag` is 0 for a plain data frame, otherwise the [`TransferKind`] of the
//! descriptor travelling with the frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::IpcError;

/// Size of the frame header on the wire
pub const HEADER_LEN: usize = 5;

/// Kind of handle attached to a frame.
///
/// `Unknown` is the sentinel used when relaying a connection that was itself
/// accepted from a listening socket. The receiver has to know from context
/// which concrete handle to build for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransferKind {
    NamedPipe = 1,
    Tcp = 2,
    Udp = 3,
    Unknown = 4,
}

impl TransferKind {
    /// Wire tag for this kind
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Decode a wire tag; 0 means "no attachment"
    pub fn from_tag(tag: u8) -> Result<Option<Self>, IpcError> {
        match tag {
            0 => Ok(None),
            1 => Ok(Some(TransferKind::NamedPipe)),
            2 => Ok(Some(TransferKind::Tcp)),
            3 => Ok(Some(TransferKind::Udp)),
            4 => Ok(Some(TransferKind::Unknown)),
            other => Err(IpcError::UnknownTag(other)),
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::NamedPipe => write!(f, "named pipe"),
            TransferKind::Tcp => write!(f, "tcp"),
            TransferKind::Udp => write!(f, "udp"),
            TransferKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub attachment: Option<TransferKind>,
    pub len: u32,
}

impl FrameHeader {
    pub fn new(attachment: Option<TransferKind>, len: u32) -> Self {
        Self { attachment, len }
    }

    /// Append the header to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.attachment.map(TransferKind::tag).unwrap_or(0));
        dst.put_u32(self.len);
    }

    /// Consume a header from the front of `src` if enough bytes are present
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, IpcError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        // Validate the tag before consuming anything
        let attachment = TransferKind::from_tag(src[0])?;
        src.advance(1);
        let len = src.get_u32();
        Ok(Some(Self { attachment, len }))
    }
}

/// Build the wire representation of one frame
pub fn encode_frame(
    payload: &[u8],
    attachment: Option<TransferKind>,
    max_frame_len: usize,
) -> Result<Bytes, IpcError> {
    if payload.len() > max_frame_len || payload.len() > u32::MAX as usize {
        return Err(IpcError::FrameTooLarge {
            len: payload.len(),
            max: max_frame_len.min(u32::MAX as usize),
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    FrameHeader::new(attachment, payload.len() as u32).encode(&mut buf);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// A complete frame as seen by the receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub attachment: Option<TransferKind>,
    pub payload: Bytes,
}

/// Incremental frame decoder.
///
/// Bytes are appended to a `BytesMut` by the transport; `decode` splits off
/// one frame at a time and remembers a header whose payload has not fully
/// arrived yet.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_len: usize,
    header: Option<FrameHeader>,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            header: None,
        }
    }

    /// Try to split one complete frame off the front of `buf`
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, IpcError> {
        let header = match self.header {
            Some(header) => header,
            None => match FrameHeader::decode(buf)? {
                Some(header) => {
                    if header.len as usize > self.max_frame_len {
                        return Err(IpcError::FrameTooLarge {
                            len: header.len as usize,
                            max: self.max_frame_len,
                        });
                    }
                    self.header = Some(header);
                    header
                }
                None => return Ok(None),
            },
        };

        let len = header.len as usize;
        if buf.len() < len {
            buf.reserve(len - buf.len());
            return Ok(None);
        }

        self.header = None;
        Ok(Some(Frame {
            attachment: header.attachment,
            payload: buf.split_to(len).freeze(),
        }))
    }

    /// True when part of a frame has been consumed or is buffered
    pub fn is_mid_frame(&self, buf: &BytesMut) -> bool {
        self.header.is_some() || !buf.is_empty()
    }

    /// Whether a complete frame is already buffered
    pub fn has_complete_frame(&self, buf: &BytesMut) -> bool {
        match self.header {
            Some(header) => buf.len() >= header.len as usize,
            None => {
                if buf.len() < HEADER_LEN {
                    return false;
                }
                let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
                buf.len() >= HEADER_LEN + len
            }
        }
    }

    /// Forget any partially decoded frame
    pub fn reset(&mut self) {
        self.header = None;
    }
}
