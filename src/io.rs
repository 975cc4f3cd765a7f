//! Buffered I/O primitives over a connection and its transport.
//!
//! `pull` makes exactly one read attempt into the connection buffer's
//! free tail; `pull_quota` retries until a quota is met or the backend
//! has nothing more right now; `push` writes until done or the channel
//! stops accepting. All three tolerate arbitrary partial transfers.
//! `read_body` hands out body bytes, always draining what is already
//! buffered before touching the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::conn::Conn;
use crate::transport::{Recv, Result, Transport};

/// Process-wide cancellation signal, checked before every pull attempt.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// Creates a lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag; in-flight reads return `Pull::Cancelled` at
    /// their next attempt.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once raised.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// This many bytes were added to the buffer (0 when the buffer had
    /// no room or the quota was 0).
    Data(usize),
    /// Channel open, nothing available right now.
    WouldBlock,
    /// Peer closed before any byte of this call arrived.
    Closed,
    /// The stop flag was raised; the read was abandoned.
    Cancelled,
}

/// Makes exactly one receive attempt into the connection buffer's free
/// tail, reading at most `max` bytes. Advances the buffer fill and the
/// cumulative read counter on success.
pub fn pull(
    transport: &mut dyn Transport,
    conn: &mut Conn,
    max: usize,
    stop: &StopFlag,
) -> Result<Pull> {
    if stop.is_raised() {
        return Ok(Pull::Cancelled);
    }
    let max = max.min(conn.buf.free());
    if max == 0 {
        return Ok(Pull::Data(0));
    }
    match transport.recv(conn.handle, &mut conn.buf.free_tail()[..max])? {
        Recv::Data(n) => {
            conn.buf.advance(n);
            conn.num_bytes_read += n as u64;
            Ok(Pull::Data(n))
        }
        Recv::WouldBlock => Ok(Pull::WouldBlock),
        Recv::Closed => Ok(Pull::Closed),
    }
}

/// Pulls repeatedly until `quota` bytes have been added, the backend has
/// nothing more right now, or the peer closes. Bytes already pulled stay
/// in the buffer whatever the outcome; `Closed` is only reported when
/// nothing at all was transferred.
pub fn pull_quota(
    transport: &mut dyn Transport,
    conn: &mut Conn,
    quota: usize,
    stop: &StopFlag,
) -> Result<Pull> {
    let mut total = 0usize;
    while total < quota {
        match pull(transport, conn, quota - total, stop)? {
            Pull::Data(0) => break,
            Pull::Data(n) => total += n,
            Pull::WouldBlock => break,
            Pull::Closed => {
                if total == 0 {
                    return Ok(Pull::Closed);
                }
                break;
            }
            Pull::Cancelled => return Ok(Pull::Cancelled),
        }
    }
    Ok(Pull::Data(total))
}

/// Writes `buf` to the channel, retrying short writes until everything
/// is sent or the channel stops accepting (a zero-length send). Returns
/// the total actually sent; a transport error means the channel is
/// broken and must be closed by the caller.
pub fn push(transport: &mut dyn Transport, conn: &mut Conn, buf: &[u8]) -> Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        let n = transport.send(conn.handle, &buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    conn.num_bytes_sent += total as u64;
    Ok(total)
}

/// Copies body bytes into `out`: already-buffered bytes between the
/// request prefix and the buffer fill come first (compacting the buffer
/// in place), then fresh bytes are pulled from the transport, bounded by
/// the declared body length. Buffered bytes are never skipped in favor
/// of a fresh read.
pub fn read_body(
    transport: &mut dyn Transport,
    conn: &mut Conn,
    out: &mut [u8],
    stop: &StopFlag,
) -> Result<Pull> {
    if conn.content_len <= 0 {
        return Ok(Pull::Data(0));
    }

    let mut nread = 0usize;

    let buffered = conn.buffered_body();
    if !out.is_empty() && buffered > 0 {
        let mut take = buffered.min(out.len());
        take = take.min(conn.content_len as usize);
        let start = conn.request_len;
        out[..take].copy_from_slice(&conn.buf.filled()[start..start + take]);
        conn.buf.consume_at(start, take);
        nread += take;
    }

    while nread < out.len() {
        if stop.is_raised() {
            return Ok(Pull::Cancelled);
        }
        let left = conn.left_to_read();
        if left <= 0 {
            break;
        }
        let want = (out.len() - nread).min(left as usize);
        match transport.recv(conn.handle, &mut out[nread..nread + want])? {
            Recv::Data(n) => {
                conn.num_bytes_read += n as u64;
                nread += n;
            }
            Recv::WouldBlock => break,
            Recv::Closed => {
                if nread == 0 {
                    return Ok(Pull::Closed);
                }
                break;
            }
        }
    }

    Ok(Pull::Data(nread))
}
