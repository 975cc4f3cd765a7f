//! Transport abstraction for stream-based connections.
//!
//! This module defines the backend contract every transport must satisfy:
//! move bytes, report readiness, never block the poll loop. Protocol code
//! above this layer holds a `Box<dyn Transport>` and opaque `Handle`s and
//! touches nothing backend-specific.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;

/// Opaque per-connection descriptor issued by a transport.
///
/// Handles are only meaningful to the transport that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A host/port pair, resolved lazily by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint from host and port.
    pub fn new(host: &str, port: u16) -> Self {
        Endpoint {
            host: host.to_string(),
            port,
        }
    }

    /// Parses a `host:port` string.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TransportError::Resolve(format!("missing port in '{}'", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TransportError::Resolve(format!("bad port in '{}'", s)))?;
        if host.is_empty() {
            return Err(TransportError::Resolve(format!("missing host in '{}'", s)));
        }
        Ok(Endpoint::new(host, port))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outcome of a single `recv` attempt.
///
/// "No data right now" and "peer closed" are distinct variants so the two
/// can never be conflated, whatever the backend's blocking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    /// `n` bytes were read into the caller's buffer.
    Data(usize),
    /// Nothing available right now; the channel is still open.
    WouldBlock,
    /// The peer closed the channel.
    Closed,
}

/// What the manager wants to hear about for one handle.
#[derive(Debug, Clone, Copy)]
pub struct Interest {
    pub handle: Handle,
    pub readable: bool,
    pub writable: bool,
}

/// What the backend reports back for one handle.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub handle: Handle,
    pub readable: bool,
    pub writable: bool,
}

/// Transport error types.
#[derive(Debug)]
pub enum TransportError {
    /// I/O error.
    Io(io::Error),
    /// Endpoint could not be resolved.
    Resolve(String),
    /// Operation on a closed channel.
    Closed,
    /// Handle unknown to this transport.
    BadHandle(Handle),
    /// Operation the backend does not provide.
    Unsupported(&'static str),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Resolve(s) => write!(f, "resolve: {}", s),
            Self::Closed => write!(f, "channel closed"),
            Self::BadHandle(h) => write!(f, "unknown handle {}", h),
            Self::Unsupported(op) => write!(f, "operation not supported: {}", op),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Backend contract for moving bytes and reporting readiness.
///
/// Implementations must never return a half-open handle from `connect`:
/// on failure the error carries the reason and no resource is leaked.
pub trait Transport {
    /// Establishes an outbound channel. May block only per the backend's
    /// own policy (the socket backend performs a deliberate one-shot
    /// blocking connect, then switches the channel to non-blocking).
    fn connect(&mut self, endpoint: &Endpoint) -> Result<Handle>;

    /// Binds a listening channel.
    fn listen(&mut self, endpoint: &Endpoint) -> Result<Handle>;

    /// Accepts one pending connection on a listening handle, or `None`
    /// when nothing is pending. Never blocks.
    fn accept(&mut self, listener: Handle) -> Result<Option<(Handle, Endpoint)>>;

    /// Best-effort partial write. `Ok(0)` means "nothing accepted right
    /// now, try again later"; an error means the channel is broken and
    /// must be closed by the caller.
    fn send(&mut self, handle: Handle, buf: &[u8]) -> Result<usize>;

    /// Single read attempt. See [`Recv`] for the outcome contract.
    fn recv(&mut self, handle: Handle, buf: &mut [u8]) -> Result<Recv>;

    /// Reports which of the given handles are ready. Must be safe to call
    /// with an empty interest list and a zero timeout (busy-poll mode).
    fn poll(&mut self, interest: &[Interest], timeout: Duration) -> Result<Vec<Readiness>>;

    /// Releases backend resources for a handle. Idempotent; never fails.
    fn close(&mut self, handle: Handle);
}

/// Implement Transport for boxed trait objects, so a manager can hold
/// its backend dynamically dispatched.
impl Transport for Box<dyn Transport> {
    fn connect(&mut self, endpoint: &Endpoint) -> Result<Handle> {
        (**self).connect(endpoint)
    }

    fn listen(&mut self, endpoint: &Endpoint) -> Result<Handle> {
        (**self).listen(endpoint)
    }

    fn accept(&mut self, listener: Handle) -> Result<Option<(Handle, Endpoint)>> {
        (**self).accept(listener)
    }

    fn send(&mut self, handle: Handle, buf: &[u8]) -> Result<usize> {
        (**self).send(handle, buf)
    }

    fn recv(&mut self, handle: Handle, buf: &mut [u8]) -> Result<Recv> {
        (**self).recv(handle, buf)
    }

    fn poll(&mut self, interest: &[Interest], timeout: Duration) -> Result<Vec<Readiness>> {
        (**self).poll(interest, timeout)
    }

    fn close(&mut self, handle: Handle) {
        (**self).close(handle)
    }
}

// =============================================================================
// Null transport (synthetic/offline connections)
// =============================================================================

/// Backend for synthetic connections that carry no live channel: every
/// recv reports closed and sends are refused.
#[derive(Default)]
pub struct NullTransport {
    next: u64,
}

impl NullTransport {
    /// Creates a new null transport.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for NullTransport {
    fn connect(&mut self, _endpoint: &Endpoint) -> Result<Handle> {
        self.next += 1;
        Ok(Handle(self.next))
    }

    fn listen(&mut self, _endpoint: &Endpoint) -> Result<Handle> {
        self.next += 1;
        Ok(Handle(self.next))
    }

    fn accept(&mut self, _listener: Handle) -> Result<Option<(Handle, Endpoint)>> {
        Ok(None)
    }

    fn send(&mut self, _handle: Handle, _buf: &[u8]) -> Result<usize> {
        Err(TransportError::Closed)
    }

    fn recv(&mut self, _handle: Handle, _buf: &mut [u8]) -> Result<Recv> {
        Ok(Recv::Closed)
    }

    fn poll(&mut self, _interest: &[Interest], _timeout: Duration) -> Result<Vec<Readiness>> {
        Ok(Vec::new())
    }

    fn close(&mut self, _handle: Handle) {}
}

// =============================================================================
// In-memory transport (tests, OS-free deployments)
// =============================================================================

struct MemChannel {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    peer_closed: bool,
    open: bool,
    pending: VecDeque<Endpoint>,
}

impl MemChannel {
    fn new() -> Self {
        MemChannel {
            inbound: VecDeque::new(),
            outbound: Vec::new(),
            peer_closed: false,
            open: true,
            pending: VecDeque::new(),
        }
    }
}

/// Scripted in-memory backend.
///
/// Test code (or an embedder with no OS sockets) feeds inbound bytes with
/// [`feed`](MemTransport::feed) and collects outbound bytes with
/// [`take_sent`](MemTransport::take_sent). `max_recv` caps how many bytes
/// a single `recv` returns, so stream fragmentation can be forced at any
/// granularity; `max_send` does the same for short writes.
pub struct MemTransport {
    channels: HashMap<Handle, MemChannel>,
    next: u64,
    /// Per-recv byte cap; 0 means unlimited.
    pub max_recv: usize,
    /// Per-send byte cap; 0 means unlimited.
    pub max_send: usize,
}

impl MemTransport {
    /// Creates an empty in-memory transport.
    pub fn new() -> Self {
        MemTransport {
            channels: HashMap::new(),
            next: 0,
            max_recv: 0,
            max_send: 0,
        }
    }

    fn alloc(&mut self) -> Handle {
        self.next += 1;
        let h = Handle(self.next);
        self.channels.insert(h, MemChannel::new());
        h
    }

    /// Opens a standalone channel without going through connect/listen.
    pub fn open(&mut self) -> Handle {
        self.alloc()
    }

    /// Queues bytes for delivery to `handle`'s next recv calls.
    pub fn feed(&mut self, handle: Handle, bytes: &[u8]) {
        if let Some(ch) = self.channels.get_mut(&handle) {
            ch.inbound.extend(bytes.iter().copied());
        }
    }

    /// Marks the peer side of `handle` closed. Buffered inbound bytes are
    /// still delivered first.
    pub fn close_peer(&mut self, handle: Handle) {
        if let Some(ch) = self.channels.get_mut(&handle) {
            ch.peer_closed = true;
        }
    }

    /// Drains everything sent on `handle` so far.
    pub fn take_sent(&mut self, handle: Handle) -> Vec<u8> {
        match self.channels.get_mut(&handle) {
            Some(ch) => std::mem::take(&mut ch.outbound),
            None => Vec::new(),
        }
    }

    /// Queues a peer for a listening handle's next `accept`.
    pub fn enqueue_accept(&mut self, listener: Handle, peer: Endpoint) {
        if let Some(ch) = self.channels.get_mut(&listener) {
            ch.pending.push_back(peer);
        }
    }

    /// True while `handle` has not been closed on our side.
    pub fn is_open(&self, handle: Handle) -> bool {
        self.channels.get(&handle).map(|ch| ch.open).unwrap_or(false)
    }

    fn channel_mut(&mut self, handle: Handle) -> Result<&mut MemChannel> {
        self.channels
            .get_mut(&handle)
            .ok_or(TransportError::BadHandle(handle))
    }
}

impl Default for MemTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemTransport {
    fn connect(&mut self, _endpoint: &Endpoint) -> Result<Handle> {
        Ok(self.alloc())
    }

    fn listen(&mut self, _endpoint: &Endpoint) -> Result<Handle> {
        Ok(self.alloc())
    }

    fn accept(&mut self, listener: Handle) -> Result<Option<(Handle, Endpoint)>> {
        let peer = match self.channel_mut(listener)?.pending.pop_front() {
            Some(p) => p,
            None => return Ok(None),
        };
        Ok(Some((self.alloc(), peer)))
    }

    fn send(&mut self, handle: Handle, buf: &[u8]) -> Result<usize> {
        let cap = self.max_send;
        let ch = self.channel_mut(handle)?;
        if ch.peer_closed || !ch.open {
            return Err(TransportError::Closed);
        }
        let n = if cap > 0 { buf.len().min(cap) } else { buf.len() };
        ch.outbound.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn recv(&mut self, handle: Handle, buf: &mut [u8]) -> Result<Recv> {
        let cap = self.max_recv;
        let ch = self.channel_mut(handle)?;
        if !ch.open {
            return Ok(Recv::Closed);
        }
        if ch.inbound.is_empty() {
            return Ok(if ch.peer_closed {
                Recv::Closed
            } else {
                Recv::WouldBlock
            });
        }
        let mut n = buf.len().min(ch.inbound.len());
        if cap > 0 {
            n = n.min(cap);
        }
        for slot in buf.iter_mut().take(n) {
            match ch.inbound.pop_front() {
                Some(b) => *slot = b,
                None => break,
            }
        }
        Ok(Recv::Data(n))
    }

    fn poll(&mut self, interest: &[Interest], _timeout: Duration) -> Result<Vec<Readiness>> {
        let mut ready = Vec::new();
        for want in interest {
            let ch = match self.channels.get(&want.handle) {
                Some(ch) if ch.open => ch,
                _ => continue,
            };
            let readable = want.readable
                && (!ch.inbound.is_empty() || ch.peer_closed || !ch.pending.is_empty());
            let writable = want.writable && !ch.peer_closed;
            if readable || writable {
                ready.push(Readiness {
                    handle: want.handle,
                    readable,
                    writable,
                });
            }
        }
        Ok(ready)
    }

    /// Marks the channel closed but keeps its record, so scripted tests
    /// can still inspect what was sent before the close.
    fn close(&mut self, handle: Handle) {
        if let Some(ch) = self.channels.get_mut(&handle) {
            ch.open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let ep = Endpoint::parse("example.org:8080").unwrap();
        assert_eq!(ep.host, "example.org");
        assert_eq!(ep.port, 8080);
        assert_eq!(ep.to_string(), "example.org:8080");

        assert!(Endpoint::parse("no-port").is_err());
        assert!(Endpoint::parse(":80").is_err());
        assert!(Endpoint::parse("host:notaport").is_err());
    }

    #[test]
    fn test_null_transport_reports_closed() {
        let mut t = NullTransport::new();
        let h = t.connect(&Endpoint::new("nowhere", 1)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(t.recv(h, &mut buf).unwrap(), Recv::Closed);
        assert!(matches!(t.send(h, b"x"), Err(TransportError::Closed)));
        t.close(h);
        t.close(h); // idempotent
    }

    #[test]
    fn test_mem_transport_fragmented_recv() {
        let mut t = MemTransport::new();
        t.max_recv = 3;
        let h = t.open();
        t.feed(h, b"abcdefgh");

        let mut buf = [0u8; 16];
        assert_eq!(t.recv(h, &mut buf).unwrap(), Recv::Data(3));
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(t.recv(h, &mut buf).unwrap(), Recv::Data(3));
        assert_eq!(t.recv(h, &mut buf).unwrap(), Recv::Data(2));
        assert_eq!(t.recv(h, &mut buf).unwrap(), Recv::WouldBlock);

        t.close_peer(h);
        assert_eq!(t.recv(h, &mut buf).unwrap(), Recv::Closed);
    }

    #[test]
    fn test_mem_transport_short_sends() {
        let mut t = MemTransport::new();
        t.max_send = 1;
        let h = t.open();
        assert_eq!(t.send(h, b"abc").unwrap(), 1);
        assert_eq!(t.send(h, b"bc").unwrap(), 1);
        assert_eq!(t.send(h, b"c").unwrap(), 1);
        assert_eq!(t.take_sent(h), b"abc");
    }

    #[test]
    fn test_mem_transport_accept_queue() {
        let mut t = MemTransport::new();
        let l = t.listen(&Endpoint::new("0.0.0.0", 80)).unwrap();
        assert!(t.accept(l).unwrap().is_none());

        t.enqueue_accept(l, Endpoint::new("10.0.0.1", 4242));
        let (h, peer) = t.accept(l).unwrap().unwrap();
        assert!(t.is_open(h));
        assert_eq!(peer.port, 4242);
    }

    #[test]
    fn test_mem_transport_poll_empty_set() {
        let mut t = MemTransport::new();
        let ready = t.poll(&[], Duration::ZERO).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_mem_transport_poll_readable_on_close() {
        let mut t = MemTransport::new();
        let h = t.open();
        let want = [Interest {
            handle: h,
            readable: true,
            writable: false,
        }];
        assert!(t.poll(&want, Duration::ZERO).unwrap().is_empty());
        t.close_peer(h);
        let ready = t.poll(&want, Duration::ZERO).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].readable);
    }
}
