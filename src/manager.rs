//! Connection manager and poll loop.
//!
//! One `Manager` owns one transport backend and an arena of connections
//! addressed by stable ids. Each `poll_once` tick asks the backend for
//! readiness exactly once, then visits every ready connection to
//! completion: listeners accept, relay pairings step their handshake or
//! shovel bytes, plain connections pull and run the frame detector.
//! Protocol outcomes surface as [`Event`]s; a single connection's
//! failure never touches the others.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::path::Path;
use std::time::Duration;

use crate::conn::{flags, Conn, ConnId, FrameState};
use crate::dial::{self, DialError};
use crate::http::framing::detect;
use crate::http::headers;
use crate::http::upload::{self, Upload, UploadError};
use crate::io::{pull_quota, push, read_body, Pull, StopFlag};
use crate::proxy::relay::{Advance, Relay, RelayError};
use crate::transport::{Endpoint, Interest, Transport, TransportError};

/// Default per-connection buffer capacity.
pub const DEFAULT_BUF_CAPACITY: usize = 16 * 1024;

/// Protocol outcomes of one poll tick, in occurrence order.
#[derive(Debug)]
pub enum Event {
    /// A listener produced a new connection.
    Accepted { conn: ConnId },
    /// A connection's request headers are complete; `request_len` and
    /// `content_len` are set.
    RequestReady { conn: ConnId },
    /// Header block contained forbidden bytes.
    BadRequest { conn: ConnId },
    /// Header block outgrew the connection buffer.
    Overflow { conn: ConnId },
    /// The connection was destroyed.
    Closed { conn: ConnId },
    /// A proxy tunnel reached the relaying state.
    RelayEstablished { client: ConnId },
    /// A proxy tunnel failed; both sides are scheduled for close.
    RelayFailed { client: ConnId, error: RelayError },
}

/// Single-threaded connection manager over one transport backend.
pub struct Manager<T: Transport> {
    transport: T,
    conns: HashMap<ConnId, Conn>,
    by_handle: HashMap<crate::transport::Handle, ConnId>,
    relays: HashMap<u32, Relay>,
    relay_of: HashMap<ConnId, u32>,
    next_conn: ConnId,
    next_relay: u32,
    buf_capacity: usize,
    stop: StopFlag,
    events: Vec<Event>,
}

impl<T: Transport> Manager<T> {
    /// Creates a manager with the default buffer capacity.
    pub fn new(transport: T) -> Self {
        Self::with_buf_capacity(transport, DEFAULT_BUF_CAPACITY)
    }

    /// Creates a manager whose connections use the given buffer
    /// capacity. The capacity bounds header size: a request whose
    /// header block does not fit is rejected with [`Event::Overflow`].
    pub fn with_buf_capacity(transport: T, buf_capacity: usize) -> Self {
        Manager {
            transport,
            conns: HashMap::new(),
            by_handle: HashMap::new(),
            relays: HashMap::new(),
            relay_of: HashMap::new(),
            next_conn: 0,
            next_relay: 0,
            buf_capacity,
            stop: StopFlag::new(),
            events: Vec::new(),
        }
    }

    /// The backend, for backend-specific setup.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// A clone of the stop flag; raising it cancels in-flight reads.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Raises the stop flag.
    pub fn stop(&self) {
        self.stop.raise();
    }

    /// Number of live connections (listeners included).
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// True when no connections are live.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Looks up a connection.
    pub fn conn(&self, id: ConnId) -> Option<&Conn> {
        self.conns.get(&id)
    }

    /// Looks up a connection mutably.
    pub fn conn_mut(&mut self, id: ConnId) -> Option<&mut Conn> {
        self.conns.get_mut(&id)
    }

    fn adopt(&mut self, mut conn: Conn) -> ConnId {
        self.next_conn += 1;
        let id = self.next_conn;
        conn.id = id;
        self.by_handle.insert(conn.handle, id);
        self.conns.insert(id, conn);
        id
    }

    /// Opens a listening connection.
    pub fn listen(&mut self, endpoint: &Endpoint) -> Result<ConnId, TransportError> {
        let handle = self.transport.listen(endpoint)?;
        let mut conn = Conn::new(handle, 0);
        conn.set_flag(flags::LISTENING);
        let id = self.adopt(conn);
        log::debug!("conn {}: listening on {}", id, endpoint);
        Ok(id)
    }

    /// Opens an outbound connection through the backend.
    pub fn connect(&mut self, endpoint: &Endpoint) -> Result<ConnId, TransportError> {
        let handle = self.transport.connect(endpoint)?;
        let mut conn = Conn::new(handle, self.buf_capacity);
        conn.peer = Some(endpoint.clone());
        Ok(self.adopt(conn))
    }

    /// Opens a client connection with the blocking one-shot bootstrap
    /// (`secure` is refused; TLS is owned outside this crate).
    pub fn dial_client(
        &mut self,
        host: &str,
        port: u16,
        secure: bool,
    ) -> Result<ConnId, DialError> {
        let conn = dial::dial(&mut self.transport, host, port, secure, self.buf_capacity)?;
        Ok(self.adopt(conn))
    }

    /// Sends a formatted request on a dialed connection and collects
    /// the whole response (until the peer closes).
    pub fn fetch(&mut self, id: ConnId, request: &[u8]) -> Result<Vec<u8>, DialError> {
        let conn = self
            .conns
            .get_mut(&id)
            .ok_or_else(|| DialError::Closed("unknown connection".into()))?;
        dial::fetch(&mut self.transport, conn, request, &self.stop)
    }

    /// Queues bytes for a connection and flushes as much as the channel
    /// accepts right now.
    pub fn send(&mut self, id: ConnId, bytes: &[u8]) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.send_queue.extend_from_slice(bytes);
        }
        self.flush(id);
    }

    /// Reads available body bytes for a connection; buffered bytes
    /// always come before fresh transport reads.
    pub fn read_body(&mut self, id: ConnId, out: &mut [u8]) -> Result<Pull, TransportError> {
        match self.conns.get_mut(&id) {
            Some(conn) => read_body(&mut self.transport, conn, out, &self.stop),
            None => Ok(Pull::Closed),
        }
    }

    /// Runs the multipart extractor on a connection whose request is
    /// terminated, writing the part into `dest_dir`.
    pub fn receive_upload(&mut self, id: ConnId, dest_dir: &Path) -> Result<Upload, UploadError> {
        let conn = self
            .conns
            .get_mut(&id)
            .ok_or(UploadError::Transport(TransportError::Closed))?;
        upload::receive_upload(&mut self.transport, conn, dest_dir, &self.stop)
    }

    /// Marks a connection to be closed once its send queue drains.
    pub fn set_close_after_flush(&mut self, id: ConnId) {
        let empty = match self.conns.get_mut(&id) {
            Some(conn) => {
                conn.set_flag(flags::CLOSE_AFTER_FLUSH);
                conn.send_queue.is_empty()
            }
            None => return,
        };
        if empty {
            self.destroy(id);
        }
    }

    /// Closes a connection now, dropping queued bytes.
    pub fn close(&mut self, id: ConnId) {
        self.destroy(id);
    }

    /// Pairs `client` with a new upstream connection to `proxy` and
    /// starts the SOCKS5 handshake toward `target`. On connect failure
    /// the client is scheduled for close and the error is returned.
    pub fn open_proxy_pair(
        &mut self,
        client: ConnId,
        proxy: &Endpoint,
        target: SocketAddrV4,
    ) -> Result<ConnId, TransportError> {
        if !self.conns.contains_key(&client) {
            return Err(TransportError::Closed);
        }
        let upstream_handle = match self.transport.connect(proxy) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("proxy connect to {} failed: {}", proxy, e);
                self.set_close_after_flush(client);
                return Err(e);
            }
        };
        let mut upstream_conn = Conn::new(upstream_handle, self.buf_capacity);
        upstream_conn.peer = Some(proxy.clone());
        upstream_conn.set_flag(flags::RELAY_UPSTREAM);
        let upstream = self.adopt(upstream_conn);
        if let Some(conn) = self.conns.get_mut(&client) {
            conn.set_flag(flags::RELAY_CLIENT);
        }

        let mut relay = Relay::new(client, upstream, target);
        relay.begin_connect();
        // The backend's connect is a completed one-shot; greet at once.
        let greeting = relay.upstream_connected();

        self.next_relay += 1;
        let rid = self.next_relay;
        self.relay_of.insert(client, rid);
        self.relay_of.insert(upstream, rid);
        self.relays.insert(rid, relay);

        self.send(upstream, &greeting);
        Ok(upstream)
    }

    /// One tick: a single readiness check, then a visit of every ready
    /// connection, run to completion. Returns the tick's events.
    pub fn poll_once(&mut self, timeout: Duration) -> Result<Vec<Event>, TransportError> {
        let mut interest = Vec::with_capacity(self.conns.len());
        for conn in self.conns.values() {
            interest.push(Interest {
                handle: conn.handle,
                readable: true,
                writable: !conn.send_queue.is_empty(),
            });
        }

        let ready = self.transport.poll(&interest, timeout)?;
        for readiness in ready {
            // The id set is re-checked per visit: an earlier visit may
            // have destroyed this connection (relay disband).
            let id = match self.by_handle.get(&readiness.handle) {
                Some(id) => *id,
                None => continue,
            };
            if readiness.writable {
                self.flush(id);
            }
            if !readiness.readable || !self.conns.contains_key(&id) {
                continue;
            }
            let is_listener = self
                .conns
                .get(&id)
                .map(|c| c.has_flag(flags::LISTENING))
                .unwrap_or(false);
            if is_listener {
                self.accept_pending(id);
            } else if self.relay_of.contains_key(&id) {
                self.step_relay(id);
            } else {
                self.read_plain(id);
            }
        }

        Ok(std::mem::take(&mut self.events))
    }

    fn accept_pending(&mut self, listener_id: ConnId) {
        let listener_handle = match self.conns.get(&listener_id) {
            Some(c) => c.handle,
            None => return,
        };
        loop {
            match self.transport.accept(listener_handle) {
                Ok(Some((handle, peer))) => {
                    let mut conn = Conn::new(handle, self.buf_capacity);
                    conn.peer = Some(peer);
                    let id = self.adopt(conn);
                    log::debug!("conn {}: accepted", id);
                    self.events.push(Event::Accepted { conn: id });
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("accept on conn {}: {}", listener_id, e);
                    break;
                }
            }
        }
    }

    fn read_plain(&mut self, id: ConnId) {
        let outcome = {
            let conn = match self.conns.get_mut(&id) {
                Some(c) => c,
                None => return,
            };
            let free = conn.buf.free();
            pull_quota(&mut self.transport, conn, free, &self.stop)
        };
        match outcome {
            Ok(Pull::Closed) => {
                self.destroy(id);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("conn {}: read error: {}", id, e);
                self.destroy(id);
                return;
            }
        }

        let conn = match self.conns.get_mut(&id) {
            Some(c) => c,
            None => return,
        };
        let before = conn.frame();
        if before != FrameState::Gathering {
            return;
        }
        let after = detect(conn);
        if after == before {
            return;
        }
        match after {
            FrameState::Terminated => {
                let head = &conn.buf.filled()[..conn.request_len];
                conn.content_len = headers::content_length(head).unwrap_or(-1);
                self.events.push(Event::RequestReady { conn: id });
            }
            FrameState::Overflow => {
                log::warn!("conn {}: header block exceeds {} bytes", id, conn.buf.capacity());
                self.events.push(Event::Overflow { conn: id });
            }
            FrameState::Malformed => {
                self.events.push(Event::BadRequest { conn: id });
            }
            FrameState::Gathering => {}
        }
    }

    fn step_relay(&mut self, id: ConnId) {
        let rid = match self.relay_of.get(&id) {
            Some(rid) => *rid,
            None => return,
        };

        let outcome = {
            let conn = match self.conns.get_mut(&id) {
                Some(c) => c,
                None => return,
            };
            let free = conn.buf.free();
            pull_quota(&mut self.transport, conn, free, &self.stop)
        };
        match outcome {
            Ok(Pull::Closed) | Err(_) => {
                // Either side dropping (or erroring) disbands the pair.
                self.fail_relay(rid, None);
                self.destroy(id);
                return;
            }
            Ok(_) => {}
        }

        let is_upstream = match self.relays.get(&rid) {
            Some(relay) => relay.upstream() == id,
            None => return,
        };

        if is_upstream {
            self.step_relay_upstream(rid, id);
        } else {
            // Client bytes: staged until the tunnel is up, forwarded
            // after.
            let relaying = self
                .relays
                .get(&rid)
                .map(|r| r.is_relaying())
                .unwrap_or(false);
            let bytes = match self.conns.get_mut(&id) {
                Some(conn) => {
                    let b = conn.buf.filled().to_vec();
                    conn.buf.clear();
                    b
                }
                None => return,
            };
            if bytes.is_empty() {
                return;
            }
            if relaying {
                let upstream = match self.relays.get(&rid) {
                    Some(r) => r.upstream(),
                    None => return,
                };
                self.send(upstream, &bytes);
            } else if let Some(relay) = self.relays.get_mut(&rid) {
                relay.stage(&bytes);
            }
        }
    }

    fn step_relay_upstream(&mut self, rid: u32, upstream_id: ConnId) {
        // Drive the handshake over whatever reply bytes are buffered.
        loop {
            let (relaying, client_id) = match self.relays.get(&rid) {
                Some(r) => (r.is_relaying(), r.client()),
                None => return,
            };
            if relaying {
                break;
            }
            let step = {
                let relay = match self.relays.get_mut(&rid) {
                    Some(r) => r,
                    None => return,
                };
                let conn = match self.conns.get(&upstream_id) {
                    Some(c) => c,
                    None => return,
                };
                relay.advance(conn.buf.filled())
            };
            match step {
                Ok(Advance::Pending) => return,
                Ok(Advance::Progress {
                    consumed,
                    send,
                    established,
                }) => {
                    if let Some(conn) = self.conns.get_mut(&upstream_id) {
                        conn.buf.consume(consumed);
                    }
                    if !send.is_empty() {
                        self.send(upstream_id, &send);
                    }
                    if established {
                        let staged = match self.relays.get_mut(&rid) {
                            Some(r) => r.take_staged(),
                            None => return,
                        };
                        if !staged.is_empty() {
                            self.send(upstream_id, &staged);
                        }
                        self.events.push(Event::RelayEstablished { client: client_id });
                        break;
                    }
                }
                Err(error) => {
                    self.fail_relay(rid, Some(error));
                    return;
                }
            }
        }

        // Tunnel is up: shovel any remaining upstream bytes to the
        // client.
        let (client_id, bytes) = {
            let client_id = match self.relays.get(&rid) {
                Some(r) => r.client(),
                None => return,
            };
            let bytes = match self.conns.get_mut(&upstream_id) {
                Some(conn) => {
                    let b = conn.buf.filled().to_vec();
                    conn.buf.clear();
                    b
                }
                None => return,
            };
            (client_id, bytes)
        };
        if !bytes.is_empty() {
            self.send(client_id, &bytes);
        }
    }

    /// Tears a relay down: both sides are scheduled for close-after-
    /// flush and the pairing record is dropped. Safe to call twice.
    fn fail_relay(&mut self, rid: u32, error: Option<RelayError>) {
        let mut relay = match self.relays.remove(&rid) {
            Some(r) => r,
            None => return,
        };
        if relay.disband() {
            if let Some(error) = error {
                log::warn!("relay for conn {}: {}", relay.client(), error);
                self.events.push(Event::RelayFailed {
                    client: relay.client(),
                    error,
                });
            }
        }
        for side in [relay.client(), relay.upstream()] {
            self.relay_of.remove(&side);
            self.set_close_after_flush(side);
        }
    }

    fn flush(&mut self, id: ConnId) {
        let (close_when_empty, result) = {
            let conn = match self.conns.get_mut(&id) {
                Some(c) => c,
                None => return,
            };
            if conn.send_queue.is_empty() {
                (conn.has_flag(flags::CLOSE_AFTER_FLUSH), Ok(0))
            } else {
                let queued = conn.send_queue.split().freeze();
                let result = push(&mut self.transport, conn, &queued);
                if let Ok(sent) = result {
                    if sent < queued.len() {
                        // Whatever the channel refused stays queued.
                        conn.send_queue = bytes::BytesMut::from(&queued[sent..]);
                    }
                }
                (conn.has_flag(flags::CLOSE_AFTER_FLUSH), result)
            }
        };
        match result {
            Ok(_) => {
                let drained = self
                    .conns
                    .get(&id)
                    .map(|c| c.send_queue.is_empty())
                    .unwrap_or(false);
                if drained && close_when_empty {
                    self.destroy(id);
                }
            }
            Err(e) => {
                log::warn!("conn {}: write error: {}", id, e);
                self.destroy(id);
            }
        }
    }

    fn destroy(&mut self, id: ConnId) {
        // A relay conn going down takes its pairing (and schedules the
        // peer) with it.
        if let Some(rid) = self.relay_of.get(&id).copied() {
            self.fail_relay(rid, None);
        }
        if let Some(conn) = self.conns.remove(&id) {
            self.by_handle.remove(&conn.handle);
            self.transport.close(conn.handle);
            log::debug!("conn {}: destroyed", id);
            self.events.push(Event::Closed { conn: id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::socks5;
    use crate::transport::MemTransport;
    use std::net::Ipv4Addr;

    fn manager() -> Manager<MemTransport> {
        Manager::new(MemTransport::new())
    }

    fn tick(m: &mut Manager<MemTransport>) -> Vec<Event> {
        m.poll_once(Duration::ZERO).unwrap()
    }

    /// Accepts one connection through a listener and returns its id.
    fn accept_one(m: &mut Manager<MemTransport>) -> ConnId {
        let listener = m.listen(&Endpoint::new("0.0.0.0", 8080)).unwrap();
        let lh = m.conn(listener).unwrap().handle;
        m.transport_mut()
            .enqueue_accept(lh, Endpoint::new("10.0.0.9", 50000));
        let events = tick(m);
        match &events[..] {
            [Event::Accepted { conn }] => *conn,
            other => panic!("expected accept, got {:?}", other),
        }
    }

    #[test]
    fn test_accept_and_request_ready() {
        let mut m = manager();
        let client = accept_one(&mut m);
        let ch = m.conn(client).unwrap().handle;

        m.transport_mut()
            .feed(ch, b"POST /u HTTP/1.1\r\nContent-Length: 4\r\n");
        assert!(tick(&mut m).is_empty());

        m.transport_mut().feed(ch, b"\r\nbody");
        let events = tick(&mut m);
        match &events[..] {
            [Event::RequestReady { conn }] => assert_eq!(*conn, client),
            other => panic!("expected request-ready, got {:?}", other),
        }
        let conn = m.conn(client).unwrap();
        assert_eq!(conn.content_len, 4);
        assert!(conn.request_len > 0);
        // The event fires exactly once.
        assert!(tick(&mut m).is_empty());
    }

    #[test]
    fn test_header_overflow_reported_once() {
        let mut m = Manager::with_buf_capacity(MemTransport::new(), 32);
        let client = accept_one(&mut m);
        let ch = m.conn(client).unwrap().handle;

        m.transport_mut().feed(ch, &[b'a'; 64]);
        let events = tick(&mut m);
        assert!(matches!(&events[..], [Event::Overflow { conn }] if *conn == client));
        assert!(tick(&mut m).is_empty());
    }

    #[test]
    fn test_malformed_header_rejected() {
        let mut m = manager();
        let client = accept_one(&mut m);
        let ch = m.conn(client).unwrap().handle;
        m.transport_mut().feed(ch, b"GET \x01/ HTTP/1.1\r\n\r\n");
        let events = tick(&mut m);
        assert!(matches!(&events[..], [Event::BadRequest { conn }] if *conn == client));
    }

    #[test]
    fn test_peer_close_destroys_conn() {
        let mut m = manager();
        let client = accept_one(&mut m);
        let ch = m.conn(client).unwrap().handle;
        m.transport_mut().close_peer(ch);
        let events = tick(&mut m);
        assert!(matches!(&events[..], [Event::Closed { conn }] if *conn == client));
        assert!(m.conn(client).is_none());
        assert_eq!(m.len(), 1); // listener remains
    }

    #[test]
    fn test_close_after_flush_drains_queue_first() {
        let mut m = manager();
        let client = accept_one(&mut m);
        let ch = m.conn(client).unwrap().handle;

        m.send(client, b"HTTP/1.1 200 OK\r\n\r\n");
        m.set_close_after_flush(client);
        assert!(m.conn(client).is_none());
        assert_eq!(m.transport_mut().take_sent(ch), b"HTTP/1.1 200 OK\r\n\r\n");
    }

    fn proxy_setup(
        m: &mut Manager<MemTransport>,
    ) -> (ConnId, ConnId, crate::transport::Handle, crate::transport::Handle) {
        let client = accept_one(m);
        let ch = m.conn(client).unwrap().handle;
        let target = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 443);
        let upstream = m
            .open_proxy_pair(client, &Endpoint::new("proxy.local", 1080), target)
            .unwrap();
        let uh = m.conn(upstream).unwrap().handle;
        // The greeting goes out as soon as the pair exists.
        assert_eq!(m.transport_mut().take_sent(uh), socks5::greeting().to_vec());
        (client, upstream, ch, uh)
    }

    #[test]
    fn test_relay_handshake_split_replies() {
        let mut m = manager();
        let (client, _upstream, ch, uh) = proxy_setup(&mut m);

        // Client speaks early; bytes must be staged, not forwarded.
        m.transport_mut().feed(ch, b"GET / HTTP/1.0\r\n\r\n");
        tick(&mut m);
        assert!(m.transport_mut().take_sent(uh).is_empty());

        // Method reply arrives one byte at a time.
        m.transport_mut().feed(uh, &[0x05]);
        assert!(tick(&mut m).is_empty());
        m.transport_mut().feed(uh, &[0x00]);
        tick(&mut m);
        let target = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 443);
        assert_eq!(
            m.transport_mut().take_sent(uh),
            socks5::connect_request(target).to_vec()
        );

        // CONNECT reply, split mid-way.
        m.transport_mut().feed(uh, &[0x05, 0x00, 0x00, 0x01, 0, 0]);
        assert!(tick(&mut m).is_empty());
        m.transport_mut().feed(uh, &[0, 0, 0, 0]);
        let events = tick(&mut m);
        assert!(
            matches!(&events[..], [Event::RelayEstablished { client: c }] if *c == client)
        );
        // Staged client bytes were flushed upstream on establishment.
        assert_eq!(m.transport_mut().take_sent(uh), b"GET / HTTP/1.0\r\n\r\n");
    }

    #[test]
    fn test_relay_forwards_both_directions() {
        let mut m = manager();
        let (_client, _upstream, ch, uh) = proxy_setup(&mut m);

        m.transport_mut().feed(uh, &[0x05, 0x00]);
        tick(&mut m);
        m.transport_mut().take_sent(uh);
        m.transport_mut()
            .feed(uh, &[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        tick(&mut m);

        m.transport_mut().feed(ch, b"to-upstream");
        tick(&mut m);
        assert_eq!(m.transport_mut().take_sent(uh), b"to-upstream");

        m.transport_mut().feed(uh, b"to-client");
        tick(&mut m);
        assert_eq!(m.transport_mut().take_sent(ch), b"to-client");
    }

    #[test]
    fn test_relay_method_rejection_closes_both() {
        let mut m = manager();
        let (client, upstream, _ch, uh) = proxy_setup(&mut m);

        m.transport_mut().feed(uh, &[0x05, 0xFF]);
        let events = tick(&mut m);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::RelayFailed { client: c, .. } if *c == client
        )));
        assert!(m.conn(client).is_none());
        assert!(m.conn(upstream).is_none());
    }

    #[test]
    fn test_relay_connect_rejection_closes_both() {
        let mut m = manager();
        let (client, upstream, _ch, uh) = proxy_setup(&mut m);

        m.transport_mut().feed(uh, &[0x05, 0x00]);
        tick(&mut m);
        m.transport_mut()
            .feed(uh, &[0x05, socks5::REP_CONN_REFUSED, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        let events = tick(&mut m);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::RelayFailed { .. })));
        assert!(m.conn(client).is_none());
        assert!(m.conn(upstream).is_none());
    }

    #[test]
    fn test_relay_peer_close_disbands_pair() {
        let mut m = manager();
        let (client, upstream, _ch, uh) = proxy_setup(&mut m);

        m.transport_mut().close_peer(uh);
        tick(&mut m);
        assert!(m.conn(client).is_none());
        assert!(m.conn(upstream).is_none());
        // A second tick is a no-op: nothing double-closes.
        assert!(tick(&mut m).is_empty());
    }

    #[test]
    fn test_failure_leaves_other_conns_untouched() {
        let mut m = manager();
        let listener = m.listen(&Endpoint::new("0.0.0.0", 8080)).unwrap();
        let lh = m.conn(listener).unwrap().handle;
        m.transport_mut()
            .enqueue_accept(lh, Endpoint::new("10.0.0.1", 1));
        m.transport_mut()
            .enqueue_accept(lh, Endpoint::new("10.0.0.2", 2));
        let events = tick(&mut m);
        let ids: Vec<ConnId> = events
            .iter()
            .filter_map(|e| match e {
                Event::Accepted { conn } => Some(*conn),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);

        let h0 = m.conn(ids[0]).unwrap().handle;
        m.transport_mut().close_peer(h0);
        tick(&mut m);
        assert!(m.conn(ids[0]).is_none());
        assert!(m.conn(ids[1]).is_some());
    }
}
