//! Per-connection state record.
//!
//! A `Conn` is the central mutable entity: one buffer, the recognized
//! request prefix, body accounting, byte counters, the transport handle
//! and a flags word. It is created by the manager on accept/connect and
//! mutated only by the poll-loop thread while that connection is being
//! visited.

use bytes::BytesMut;

use crate::buffer::Buffer;
use crate::http::framing::FrameDetector;
use crate::transport::{Endpoint, Handle};

/// Stable connection identifier within one manager.
pub type ConnId = u32;

/// Connection flag bits.
pub mod flags {
    /// This connection is listening.
    pub const LISTENING: u32 = 1 << 0;
    /// Outbound connect in progress.
    pub const CONNECTING: u32 = 1 << 1;
    /// Push remaining queued bytes, then close.
    pub const CLOSE_AFTER_FLUSH: u32 = 1 << 2;
    /// Close on the next tick without flushing.
    pub const CLOSE_NOW: u32 = 1 << 3;
    /// Client-facing side of a proxy relay pairing.
    pub const RELAY_CLIENT: u32 = 1 << 4;
    /// Upstream side of a proxy relay pairing.
    pub const RELAY_UPSTREAM: u32 = 1 << 5;
}

/// Opaque secure-channel descriptor. The TLS layer owning it lives
/// outside this crate; the engine only carries the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureChannel(pub u64);

/// Frame-detection state of the inbound byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Still collecting header bytes.
    Gathering,
    /// Terminator found; `request_len` is set.
    Terminated,
    /// Buffer filled to capacity without a terminator.
    Overflow,
    /// Header block contains bytes no header may contain.
    Malformed,
}

impl std::fmt::Display for FrameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gathering => write!(f, "gathering"),
            Self::Terminated => write!(f, "terminated"),
            Self::Overflow => write!(f, "overflow"),
            Self::Malformed => write!(f, "malformed"),
        }
    }
}

/// Per-connection state.
pub struct Conn {
    /// Manager-assigned id; 0 until adopted by a manager.
    pub id: ConnId,
    /// Transport descriptor.
    pub handle: Handle,
    /// Inbound byte buffer. `buf.len()` is the `data_len` of the record.
    pub buf: Buffer,
    /// Length of the recognized header/request prefix, 0 while the
    /// request is still unterminated. Always `<= buf.len()`.
    pub request_len: usize,
    /// Declared body length; -1 while unknown.
    pub content_len: i64,
    /// Cumulative bytes pulled from the transport.
    pub num_bytes_read: u64,
    /// Cumulative bytes pushed to the transport.
    pub num_bytes_sent: u64,
    /// Flag bits, see [`flags`].
    pub flags: u32,
    /// Frame detector state and scan cache.
    pub detector: FrameDetector,
    /// Secure-channel slot, owned elsewhere.
    pub secure: Option<SecureChannel>,
    /// Remote endpoint, when known.
    pub peer: Option<Endpoint>,
    /// Outbound bytes waiting for the channel to accept them.
    pub send_queue: BytesMut,
}

impl Conn {
    /// Creates a connection over `handle` with the given buffer capacity.
    pub fn new(handle: Handle, buf_capacity: usize) -> Self {
        Conn {
            id: 0,
            handle,
            buf: Buffer::with_capacity(buf_capacity),
            request_len: 0,
            content_len: -1,
            num_bytes_read: 0,
            num_bytes_sent: 0,
            flags: 0,
            detector: FrameDetector::new(),
            secure: None,
            peer: None,
            send_queue: BytesMut::new(),
        }
    }

    /// Current frame state.
    pub fn frame(&self) -> FrameState {
        self.detector.state()
    }

    /// Tests a flag bit.
    pub fn has_flag(&self, bit: u32) -> bool {
        self.flags & bit != 0
    }

    /// Sets a flag bit.
    pub fn set_flag(&mut self, bit: u32) {
        self.flags |= bit;
    }

    /// Clears a flag bit.
    pub fn clear_flag(&mut self, bit: u32) {
        self.flags &= !bit;
    }

    /// Body bytes already buffered past the request prefix.
    pub fn buffered_body(&self) -> usize {
        self.buf.len() - self.request_len
    }

    /// Bytes of the declared body still to be read from the transport,
    /// counted against the cumulative read counter. Negative means the
    /// peer sent more than it declared.
    pub fn left_to_read(&self) -> i64 {
        if self.content_len < 0 {
            return 0;
        }
        self.content_len + self.request_len as i64 - self.num_bytes_read as i64
    }

    /// Discards the consumed request (prefix plus any unread body bytes
    /// already buffered, bounded by the declared length) and re-arms the
    /// frame detector for the next request on the same channel.
    pub fn reset_for_next_request(&mut self) {
        let mut drop_len = self.request_len;
        if self.content_len > 0 {
            let body_buffered = (self.buf.len() - self.request_len).min(self.content_len as usize);
            drop_len += body_buffered;
        }
        self.buf.consume(drop_len);
        self.request_len = 0;
        self.content_len = -1;
        self.detector = FrameDetector::new();
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("data_len", &self.buf.len())
            .field("request_len", &self.request_len)
            .field("content_len", &self.content_len)
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("frame", &self.frame())
            .finish()
    }
}
