//! Request frame boundary detection.
//!
//! A header block ends at the first empty line. The detector runs over
//! the connection buffer after every pull, tolerating any fragmentation
//! of the underlying stream, and caches how far it has scanned so
//! repeated pulls never re-walk the whole prefix.

use crate::conn::{Conn, FrameState};

/// The canonical request terminator on the wire.
pub const TERMINATOR: &[u8] = b"\r\n\r\n";

/// Result of scanning a buffer for a complete header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// No terminator yet; more bytes needed.
    Partial,
    /// A byte no header block may contain was found.
    Malformed,
    /// Complete header block of this many bytes, terminator included.
    Complete(usize),
}

/// Scans `buf` for the end of a header block.
///
/// Control bytes other than CR/LF and TAB are rejected immediately; a
/// later terminator never rescues a malformed prefix. Both LF LF and
/// LF CR LF terminate (the latter covers CR LF CR LF).
pub fn scan_request(buf: &[u8]) -> Scan {
    scan_request_from(buf, 0)
}

fn scan_request_from(buf: &[u8], start: usize) -> Scan {
    for i in start..buf.len() {
        let b = buf[i];
        if b < b' ' && b != b'\r' && b != b'\n' && b != b'\t' {
            return Scan::Malformed;
        }
        if b == b'\n' {
            if i + 1 < buf.len() && buf[i + 1] == b'\n' {
                return Scan::Complete(i + 2);
            }
            if i + 2 < buf.len() && buf[i + 1] == b'\r' && buf[i + 2] == b'\n' {
                return Scan::Complete(i + 3);
            }
        }
    }
    Scan::Partial
}

/// How many trailing bytes of a partial scan may still belong to a
/// terminator split across pulls ("\n\r" + next "\n" is the worst case,
/// re-checked with one byte of slack).
const SCAN_BACKUP: usize = 3;

/// Incremental frame detector: Gathering until a terminator arrives,
/// Overflow when the buffer fills without one, Malformed on forbidden
/// bytes. Overflow and Malformed are terminal and reported exactly once
/// by the state transition.
#[derive(Debug)]
pub struct FrameDetector {
    state: FrameState,
    scanned: usize,
    request_len: usize,
}

impl FrameDetector {
    /// Creates a detector in the Gathering state.
    pub fn new() -> Self {
        FrameDetector {
            state: FrameState::Gathering,
            scanned: 0,
            request_len: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Header block length once Terminated, 0 before.
    pub fn request_len(&self) -> usize {
        self.request_len
    }

    /// Runs one scan over the buffer's current content. `at_capacity`
    /// tells the detector there will never be more room for header
    /// bytes. Cheap on repeat calls: only unscanned bytes are walked.
    pub fn scan(&mut self, buf: &[u8], at_capacity: bool) -> FrameState {
        if self.state != FrameState::Gathering {
            return self.state;
        }
        let start = self.scanned.saturating_sub(SCAN_BACKUP);
        match scan_request_from(buf, start) {
            Scan::Complete(len) => {
                self.request_len = len;
                self.state = FrameState::Terminated;
            }
            Scan::Malformed => {
                self.state = FrameState::Malformed;
            }
            Scan::Partial => {
                self.scanned = buf.len();
                if at_capacity {
                    self.state = FrameState::Overflow;
                }
            }
        }
        self.state
    }
}

impl Default for FrameDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the detector over a connection's buffer and records the request
/// length on termination. Returns the (possibly unchanged) frame state.
pub fn detect(conn: &mut Conn) -> FrameState {
    let state = conn.detector.scan(conn.buf.filled(), conn.buf.is_full());
    if state == FrameState::Terminated {
        conn.request_len = conn.detector.request_len();
    }
    state
}
