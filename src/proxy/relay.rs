//! SOCKS5 relay pairing state machine. No I/O happens here.
//!
//! A `Relay` pairs the client-facing connection with the upstream
//! connection opened to the proxy server. The machine consumes upstream
//! reply bytes and returns what to send next; the manager executes the
//! I/O. Client bytes that arrive before the tunnel is up are staged and
//! flushed the moment the CONNECT reply lands.

use std::net::SocketAddrV4;

use bytes::BytesMut;

use crate::conn::ConnId;
use crate::proxy::socks5::{self, Socks5Error};

/// Relay lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Pairing created, upstream connect not yet issued.
    Init,
    /// Upstream connect in flight.
    Connecting,
    /// No-auth greeting sent, waiting for the 2-byte method reply.
    HandshakeSent,
    /// CONNECT request sent, waiting for the 10-byte reply.
    ConnectRequestSent,
    /// Tunnel established; bytes shovel both ways.
    Relaying,
    /// Terminal: both sides are being torn down.
    Disbanded,
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Connecting => write!(f, "connecting"),
            Self::HandshakeSent => write!(f, "handshake-sent"),
            Self::ConnectRequestSent => write!(f, "connect-request-sent"),
            Self::Relaying => write!(f, "relaying"),
            Self::Disbanded => write!(f, "disbanded"),
        }
    }
}

/// Relay errors. Any of these disbands the pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    /// The proxy rejected the handshake or the CONNECT.
    Socks(Socks5Error),
    /// The upstream channel closed mid-handshake.
    UpstreamClosed,
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socks(e) => write!(f, "proxy: {}", e),
            Self::UpstreamClosed => write!(f, "proxy closed during handshake"),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Socks(e) => Some(e),
            Self::UpstreamClosed => None,
        }
    }
}

impl From<Socks5Error> for RelayError {
    fn from(e: Socks5Error) -> Self {
        Self::Socks(e)
    }
}

/// What `advance` made of the upstream bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum Advance {
    /// Reply still short; wait for more bytes, consuming nothing.
    Pending,
    /// Handshake moved forward.
    Progress {
        /// Upstream bytes consumed by this step.
        consumed: usize,
        /// Bytes to send upstream next, empty when none.
        send: Vec<u8>,
        /// True exactly when the machine entered Relaying.
        established: bool,
    },
}

/// One client/upstream pairing.
pub struct Relay {
    client: ConnId,
    upstream: ConnId,
    target: SocketAddrV4,
    state: RelayState,
    staged: BytesMut,
}

impl Relay {
    /// Creates a pairing in the Init state.
    pub fn new(client: ConnId, upstream: ConnId, target: SocketAddrV4) -> Self {
        Relay {
            client,
            upstream,
            target,
            state: RelayState::Init,
            staged: BytesMut::new(),
        }
    }

    /// Client-facing connection id.
    pub fn client(&self) -> ConnId {
        self.client
    }

    /// Upstream (proxy-facing) connection id.
    pub fn upstream(&self) -> ConnId {
        self.upstream
    }

    /// Current state.
    pub fn state(&self) -> RelayState {
        self.state
    }

    /// The other half of the pairing, if `id` is one of the two.
    pub fn peer_of(&self, id: ConnId) -> Option<ConnId> {
        if id == self.client {
            Some(self.upstream)
        } else if id == self.upstream {
            Some(self.client)
        } else {
            None
        }
    }

    /// True once the tunnel is up.
    pub fn is_relaying(&self) -> bool {
        self.state == RelayState::Relaying
    }

    /// True once torn down.
    pub fn is_disbanded(&self) -> bool {
        self.state == RelayState::Disbanded
    }

    /// Marks the upstream connect as issued.
    pub fn begin_connect(&mut self) {
        if self.state == RelayState::Init {
            self.state = RelayState::Connecting;
        }
    }

    /// The upstream connect completed: returns the greeting to send and
    /// enters HandshakeSent.
    pub fn upstream_connected(&mut self) -> [u8; 3] {
        self.state = RelayState::HandshakeSent;
        socks5::greeting()
    }

    /// Queues client bytes sent before the tunnel is up.
    pub fn stage(&mut self, bytes: &[u8]) {
        self.staged.extend_from_slice(bytes);
    }

    /// Takes the staged client bytes for flushing upstream.
    pub fn take_staged(&mut self) -> BytesMut {
        std::mem::take(&mut self.staged)
    }

    /// Feeds buffered upstream bytes into the handshake. A short reply
    /// is not an error; the machine waits. Errors must be answered
    /// with `disband`.
    pub fn advance(&mut self, upstream_bytes: &[u8]) -> Result<Advance, RelayError> {
        match self.state {
            RelayState::HandshakeSent => match socks5::parse_method_reply(upstream_bytes) {
                None => Ok(Advance::Pending),
                Some(Err(e)) => Err(e.into()),
                Some(Ok(())) => {
                    self.state = RelayState::ConnectRequestSent;
                    log::debug!("relay {}↔{}: method accepted, sending CONNECT", self.client, self.upstream);
                    Ok(Advance::Progress {
                        consumed: socks5::METHOD_REPLY_LEN,
                        send: socks5::connect_request(self.target).to_vec(),
                        established: false,
                    })
                }
            },
            RelayState::ConnectRequestSent => match socks5::parse_connect_reply(upstream_bytes) {
                None => Ok(Advance::Pending),
                Some(Err(e)) => Err(e.into()),
                Some(Ok(())) => {
                    self.state = RelayState::Relaying;
                    log::debug!("relay {}↔{}: tunnel established", self.client, self.upstream);
                    Ok(Advance::Progress {
                        consumed: socks5::CONNECT_REPLY_LEN,
                        send: Vec::new(),
                        established: true,
                    })
                }
            },
            // Nothing to do with handshake bytes in the other states.
            _ => Ok(Advance::Pending),
        }
    }

    /// Tears the pairing down. Idempotent: only the first call reports
    /// having done anything, so close scheduling runs exactly once.
    pub fn disband(&mut self) -> bool {
        if self.state == RelayState::Disbanded {
            return false;
        }
        log::debug!("relay {}↔{}: disbanding from {}", self.client, self.upstream, self.state);
        self.state = RelayState::Disbanded;
        self.staged.clear();
        true
    }
}
