//! Synchronous client bootstrap.
//!
//! `dial` and `fetch` are the deliberately blocking one-shot client
//! path: establish a single outbound connection (the backend's sole
//! blocking exception) and optionally run one request/response exchange
//! before the connection joins a manager's steady-state poll loop.

use std::time::Duration;

use crate::conn::Conn;
use crate::io::{pull, push, Pull, StopFlag};
use crate::transport::{Endpoint, Interest, Transport, TransportError};

/// How long one readiness wait may last before the stop flag is
/// re-checked.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Client bootstrap errors.
#[derive(Debug)]
pub enum DialError {
    /// A secure channel was requested; TLS is owned outside this crate.
    TlsUnavailable,
    /// The backend could not produce a connection.
    Transport(TransportError),
    /// The channel broke during the exchange.
    Closed(String),
    /// The stop flag was raised.
    Cancelled,
}

impl std::fmt::Display for DialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TlsUnavailable => write!(f, "secure channels are not available here"),
            Self::Transport(e) => write!(f, "dial: {}", e),
            Self::Closed(s) => write!(f, "dial: {}", s),
            Self::Cancelled => write!(f, "dial cancelled"),
        }
    }
}

impl std::error::Error for DialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for DialError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Opens a client connection to `host:port`.
///
/// Never returns a half-open connection: on failure the error describes
/// what went wrong and no handle leaks. `secure` is refused; the
/// engine only carries an opaque slot for a secure channel owned
/// elsewhere.
pub fn dial(
    transport: &mut dyn Transport,
    host: &str,
    port: u16,
    secure: bool,
    buf_capacity: usize,
) -> Result<Conn, DialError> {
    if secure {
        return Err(DialError::TlsUnavailable);
    }
    let endpoint = Endpoint::new(host, port);
    let handle = transport.connect(&endpoint)?;
    log::debug!("dialed {} as {}", endpoint, handle);
    let mut conn = Conn::new(handle, buf_capacity);
    conn.peer = Some(endpoint);
    Ok(conn)
}

/// Sends a formatted request and collects the entire response, reading
/// until the peer closes. Simple synchronous client use only; managed
/// connections go through the poll loop instead.
pub fn fetch(
    transport: &mut dyn Transport,
    conn: &mut Conn,
    request: &[u8],
    stop: &StopFlag,
) -> Result<Vec<u8>, DialError> {
    let sent = push(transport, conn, request)?;
    if sent < request.len() {
        return Err(DialError::Closed(format!(
            "request truncated at {} of {} bytes",
            sent,
            request.len()
        )));
    }

    let mut response = Vec::new();
    loop {
        let max = conn.buf.free();
        match pull(transport, conn, max, stop)? {
            Pull::Data(_) => {
                response.extend_from_slice(conn.buf.filled());
                conn.buf.clear();
            }
            Pull::WouldBlock => {
                if stop.is_raised() {
                    return Err(DialError::Cancelled);
                }
                let interest = [Interest {
                    handle: conn.handle,
                    readable: true,
                    writable: false,
                }];
                transport.poll(&interest, WAIT_SLICE)?;
            }
            Pull::Closed => break,
            Pull::Cancelled => return Err(DialError::Cancelled),
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemTransport;

    #[test]
    fn test_dial_refuses_secure() {
        let mut t = MemTransport::new();
        let err = dial(&mut t, "example.org", 443, true, 1024).unwrap_err();
        assert!(matches!(err, DialError::TlsUnavailable));
    }

    #[test]
    fn test_dial_sets_peer() {
        let mut t = MemTransport::new();
        let conn = dial(&mut t, "example.org", 80, false, 1024).unwrap();
        assert_eq!(conn.peer.as_ref().unwrap().to_string(), "example.org:80");
        assert_eq!(conn.buf.capacity(), 1024);
    }

    #[test]
    fn test_fetch_collects_until_close() {
        let mut t = MemTransport::new();
        t.max_recv = 5; // fragment the response arbitrarily
        let stop = StopFlag::new();
        let mut conn = dial(&mut t, "example.org", 80, false, 64).unwrap();

        t.feed(conn.handle, b"HTTP/1.0 200 OK\r\n\r\nhello world");
        t.close_peer(conn.handle);

        let request = b"GET / HTTP/1.0\r\n\r\n";
        let response = fetch(&mut t, &mut conn, request, &stop).unwrap();
        assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\nhello world");
        assert_eq!(t.take_sent(conn.handle), request);
        assert_eq!(conn.num_bytes_sent, request.len() as u64);
        assert_eq!(conn.num_bytes_read, response.len() as u64);
    }

    #[test]
    fn test_fetch_cancelled_by_stop_flag() {
        let mut t = MemTransport::new();
        let stop = StopFlag::new();
        let mut conn = dial(&mut t, "example.org", 80, false, 64).unwrap();
        stop.raise();
        let err = fetch(&mut t, &mut conn, b"GET / HTTP/1.0\r\n\r\n", &stop).unwrap_err();
        assert!(matches!(err, DialError::Cancelled));
    }

    #[test]
    fn test_fetch_short_write_is_error() {
        let mut t = MemTransport::new();
        let stop = StopFlag::new();
        let mut conn = dial(&mut t, "example.org", 80, false, 64).unwrap();
        t.close_peer(conn.handle); // sends now fail
        let err = fetch(&mut t, &mut conn, b"GET /\r\n\r\n", &stop);
        assert!(err.is_err());
    }
}
