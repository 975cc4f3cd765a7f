//! Streaming multipart/form-data upload extraction.
//!
//! Consumes a connection whose surrounding request is already
//! terminated, pulls one file part out of the body and streams it to a
//! file in a caller-supplied directory. The buffer is compacted in
//! place as data is consumed, so memory use stays proportional to the
//! delimiter length however large the part is.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::conn::Conn;
use crate::http::{framing, headers};
use crate::io::{pull, Pull, StopFlag};
use crate::transport::{Interest, Transport, TransportError};

/// How long one readiness wait may last before the stop flag is
/// re-checked.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Upload extraction errors.
#[derive(Debug)]
pub enum UploadError {
    /// The request declares no usable multipart boundary.
    MissingBoundary,
    /// The part headers carry no filename.
    MissingFilename,
    /// The part's header block never terminated (or was malformed).
    PartHeaders,
    /// The input ended before the part's closing delimiter.
    BoundaryNotFound,
    /// The destination file could not be created.
    Create { path: PathBuf, source: io::Error },
    /// Writing to the destination file failed.
    Io(io::Error),
    /// The transport failed.
    Transport(TransportError),
    /// The stop flag was raised mid-extraction.
    Cancelled,
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingBoundary => write!(f, "no multipart boundary declared"),
            Self::MissingFilename => write!(f, "part carries no filename"),
            Self::PartHeaders => write!(f, "part headers incomplete"),
            Self::BoundaryNotFound => write!(f, "input ended before part delimiter"),
            Self::Create { path, source } => {
                write!(f, "cannot create {}: {}", path.display(), source)
            }
            Self::Io(e) => write!(f, "upload I/O error: {}", e),
            Self::Transport(e) => write!(f, "upload transport error: {}", e),
            Self::Cancelled => write!(f, "upload cancelled"),
        }
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Create { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for UploadError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<TransportError> for UploadError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// A successfully extracted part: the destination file, rewound and
/// still open, plus the path it was written to.
#[derive(Debug)]
pub struct Upload {
    pub file: File,
    pub path: PathBuf,
}

/// Outcome of one attempt to get more body bytes.
enum Refill {
    /// At least one byte arrived.
    Progress,
    /// The source is done: declared length exhausted or peer closed.
    NoMore,
    /// The buffer has no room left.
    Full,
}

/// Extracts one uploaded file from a terminated request into
/// `dest_dir`.
///
/// The filename comes from the part's Content-Disposition line,
/// reduced to its final path segment; whatever directory components
/// the client declared never escape `dest_dir`. A pre-existing file at
/// the destination is overwritten. On success the returned file is
/// rewound and open for reading; on failure the partial file is
/// removed and nothing is returned.
pub fn receive_upload(
    transport: &mut dyn Transport,
    conn: &mut Conn,
    dest_dir: &Path,
    stop: &StopFlag,
) -> Result<Upload, UploadError> {
    let head = &conn.buf.filled()[..conn.request_len];
    let content_type = headers::header_value(head, "Content-Type").unwrap_or(b"");
    let boundary: Vec<u8> = match headers::boundary_token(content_type) {
        Some(token) => token.to_vec(),
        None => return Err(UploadError::MissingBoundary),
    };
    if conn.content_len < 0 {
        if let Some(n) = headers::content_length(head) {
            conn.content_len = n;
        }
    }

    // Pull until the part's header block (opening delimiter line plus
    // part headers) is terminated.
    let headers_len = loop {
        let region = &conn.buf.filled()[conn.request_len..];
        match framing::scan_request(region) {
            framing::Scan::Complete(n) => break n,
            framing::Scan::Malformed => return Err(UploadError::PartHeaders),
            framing::Scan::Partial => match refill(transport, conn, stop)? {
                Refill::Progress => {}
                Refill::NoMore | Refill::Full => return Err(UploadError::PartHeaders),
            },
        }
    };

    let part_head = &conn.buf.filled()[conn.request_len..conn.request_len + headers_len];

    // The closing delimiter is CRLF plus the opening delimiter line the
    // client actually sent. Clients routinely pad the declared token
    // with extra dashes; the opening line is authoritative as long as
    // it carries the declared token.
    let first_line_len = part_head
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| {
            if i > 0 && part_head[i - 1] == b'\r' {
                i - 1
            } else {
                i
            }
        })
        .unwrap_or(0);
    let first_line = &part_head[..first_line_len];
    let mut delimiter = Vec::with_capacity(first_line_len + 2);
    delimiter.extend_from_slice(b"\r\n");
    if first_line.starts_with(b"--") && first_line.ends_with(&boundary[..]) {
        delimiter.extend_from_slice(first_line);
    } else {
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(&boundary);
    }

    let name = match headers::filename(part_head) {
        Some(declared) => {
            let clean = headers::sanitize_filename(&declared).to_string();
            if clean.is_empty() {
                return Err(UploadError::MissingFilename);
            }
            clean
        }
        None => return Err(UploadError::MissingFilename),
    };

    conn.buf.consume_at(conn.request_len, headers_len);

    let path = dest_dir.join(&name);
    // Exclusive-lock intent: concurrent uploads to the same name race.
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(|source| UploadError::Create {
            path: path.clone(),
            source,
        })?;
    log::debug!("upload: writing part to {}", path.display());

    // Stream body bytes to the file, watching for the delimiter across
    // pull boundaries. Holding back `delimiter.len()` trailing bytes
    // guarantees a split delimiter is never flushed into the file.
    let retain = delimiter.len();
    loop {
        if stop.is_raised() {
            discard(file, &path);
            return Err(UploadError::Cancelled);
        }

        let region = &conn.buf.filled()[conn.request_len..];
        if let Some(data_len) = find_delimiter(region, &delimiter) {
            if let Err(e) = file.write_all(&region[..data_len]) {
                discard(file, &path);
                return Err(UploadError::Io(e));
            }
            conn.buf.consume_at(conn.request_len, data_len + retain);
            if let Err(e) = file.flush().and_then(|_| file.seek(SeekFrom::Start(0)).map(|_| ())) {
                discard(file, &path);
                return Err(UploadError::Io(e));
            }
            return Ok(Upload { file, path });
        }

        if region.len() > retain {
            let flush_len = region.len() - retain;
            if let Err(e) = file.write_all(&region[..flush_len]) {
                discard(file, &path);
                return Err(UploadError::Io(e));
            }
            conn.buf.consume_at(conn.request_len, flush_len);
        }

        match refill(transport, conn, stop) {
            Ok(Refill::Progress) => {}
            Ok(Refill::NoMore) | Ok(Refill::Full) => {
                discard(file, &path);
                return Err(UploadError::BoundaryNotFound);
            }
            Err(e) => {
                discard(file, &path);
                return Err(e);
            }
        }
    }
}

/// Finds the part delimiter in `region`, returning the number of data
/// bytes that precede it.
fn find_delimiter(region: &[u8], delimiter: &[u8]) -> Option<usize> {
    if region.len() < delimiter.len() {
        return None;
    }
    region
        .windows(delimiter.len())
        .position(|w| w == delimiter)
}

/// Pulls more body bytes, bounded by the declared outer length when one
/// was given. Waits on transport readiness between empty attempts.
fn refill(
    transport: &mut dyn Transport,
    conn: &mut Conn,
    stop: &StopFlag,
) -> Result<Refill, UploadError> {
    let max = if conn.content_len < 0 {
        conn.buf.free()
    } else {
        let left = conn.left_to_read();
        if left <= 0 {
            return Ok(Refill::NoMore);
        }
        (left as usize).min(conn.buf.free())
    };
    if max == 0 {
        return Ok(Refill::Full);
    }

    loop {
        match pull(transport, conn, max, stop)? {
            Pull::Data(0) => return Ok(Refill::Full),
            Pull::Data(_) => return Ok(Refill::Progress),
            Pull::Closed => return Ok(Refill::NoMore),
            Pull::Cancelled => return Err(UploadError::Cancelled),
            Pull::WouldBlock => {
                if stop.is_raised() {
                    return Err(UploadError::Cancelled);
                }
                let interest = [Interest {
                    handle: conn.handle,
                    readable: true,
                    writable: false,
                }];
                transport.poll(&interest, WAIT_SLICE)?;
            }
        }
    }
}

fn discard(file: File, path: &Path) {
    drop(file);
    if let Err(e) = fs::remove_file(path) {
        log::warn!("upload: cannot remove partial file {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::framing::detect;
    use crate::conn::FrameState;
    use crate::transport::MemTransport;
    use std::io::Read;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("muxnet_upload_{}", tag));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn multipart_request(boundary_decl: &str, dash_line: &str, filename: &str, payload: &[u8]) -> Vec<u8> {
        let mut req = Vec::new();
        let body_tail = {
            let mut b = Vec::new();
            b.extend_from_slice(dash_line.as_bytes());
            b.extend_from_slice(b"\r\n");
            b.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"f\"; filename=\"{}\"\r\n\r\n",
                    filename
                )
                .as_bytes(),
            );
            b.extend_from_slice(payload);
            b.extend_from_slice(b"\r\n");
            b.extend_from_slice(dash_line.as_bytes());
            b.extend_from_slice(b"--");
            b
        };
        req.extend_from_slice(
            format!(
                "POST /u HTTP/1.1\r\nContent-Type: multipart/form-data; boundary={}\r\nContent-Length: {}\r\n\r\n",
                boundary_decl,
                body_tail.len()
            )
            .as_bytes(),
        );
        req.extend_from_slice(&body_tail);
        req
    }

    /// Feeds a full request through a fragmented transport and runs the
    /// extractor once the surrounding request terminates.
    fn run_extraction(
        request: &[u8],
        chunk: usize,
        dir: &Path,
    ) -> (Result<Upload, UploadError>, Conn) {
        let mut t = MemTransport::new();
        t.max_recv = chunk;
        let h = t.open();
        t.feed(h, request);
        t.close_peer(h);

        let stop = StopFlag::new();
        let mut conn = Conn::new(h, 8192);
        loop {
            match pull(&mut t, &mut conn, 8192, &stop).unwrap() {
                Pull::Data(_) => {}
                other => panic!("unexpected pull outcome {:?}", other),
            }
            if detect(&mut conn) == FrameState::Terminated {
                break;
            }
        }
        let result = receive_upload(&mut t, &mut conn, dir, &stop);
        (result, conn)
    }

    #[test]
    fn test_basic_extraction() {
        let dir = temp_dir("basic");
        let req = multipart_request("xyz", "--xyz", "photo.png", b"PNGDATA");
        let (result, _) = run_extraction(&req, 0, &dir);
        let upload = result.unwrap();
        assert_eq!(upload.path, dir.join("photo.png"));

        let mut file = upload.file;
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"PNGDATA");
    }

    #[test]
    fn test_three_byte_chunks_overdashed_boundary() {
        // boundary declared as X, parts delimited by ------X, delivered
        // in 3-byte fragments.
        let dir = temp_dir("chunks3");
        let req = multipart_request("X", "------X", "a.png", b"abcd");
        let (result, _) = run_extraction(&req, 3, &dir);
        let upload = result.unwrap();
        assert_eq!(upload.path, dir.join("a.png"));

        let mut content = Vec::new();
        upload.file.take(64).read_to_end(&mut content).unwrap();
        assert_eq!(content, b"abcd");
    }

    #[test]
    fn test_every_fragmentation_offset() {
        // Payload longer than the delimiter, split at every possible
        // recv granularity: the extracted bytes must be identical.
        let dir = temp_dir("offsets");
        let payload = b"0123456789abcdefghij0123456789abcdefghij";
        let req = multipart_request("bnd", "--bnd", "data.bin", payload);
        for chunk in 1..=req.len() {
            let (result, _) = run_extraction(&req, chunk, &dir);
            let upload = result.unwrap();
            let mut content = Vec::new();
            upload.file.take(256).read_to_end(&mut content).unwrap();
            assert_eq!(content, payload, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_payload_shorter_than_boundary() {
        let dir = temp_dir("short");
        let req = multipart_request("averylongboundarytoken", "--averylongboundarytoken", "s.bin", b"xy");
        for chunk in [1, 2, 5, 0] {
            let (result, _) = run_extraction(&req, chunk, &dir);
            let upload = result.unwrap();
            let mut content = Vec::new();
            upload.file.take(64).read_to_end(&mut content).unwrap();
            assert_eq!(content, b"xy");
        }
    }

    #[test]
    fn test_filename_traversal_confined() {
        let dir = temp_dir("traversal");
        for (declared, expected) in [
            ("../etc/passwd", "passwd"),
            ("..\\..\\x", "x"),
            ("name.png", "name.png"),
        ] {
            let req = multipart_request("b1", "--b1", declared, b"data");
            let (result, _) = run_extraction(&req, 0, &dir);
            let upload = result.unwrap();
            assert_eq!(upload.path, dir.join(expected));
            assert!(upload.path.starts_with(&dir));
        }
    }

    #[test]
    fn test_missing_filename_aborts() {
        let dir = temp_dir("nofname");
        let mut req = Vec::new();
        let body = b"--b2\r\nContent-Disposition: form-data; name=\"field\"\r\n\r\nvalue\r\n--b2--";
        req.extend_from_slice(
            format!(
                "POST /u HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=b2\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        );
        req.extend_from_slice(body);
        let (result, _) = run_extraction(&req, 0, &dir);
        assert!(matches!(result, Err(UploadError::MissingFilename)));
    }

    #[test]
    fn test_missing_boundary_declaration() {
        let dir = temp_dir("nobnd");
        let req = b"POST /u HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\nbody";
        let (result, _) = run_extraction(req, 0, &dir);
        assert!(matches!(result, Err(UploadError::MissingBoundary)));
    }

    #[test]
    fn test_source_exhausted_leaves_no_file() {
        let dir = temp_dir("exhausted");
        // Close the stream before the closing delimiter ever arrives.
        let req = b"POST /u HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=b3\r\nContent-Length: 400\r\n\r\n\
            --b3\r\nContent-Disposition: form-data; name=\"f\"; filename=\"lost.bin\"\r\n\r\nsome data, no delimiter";
        let (result, _) = run_extraction(req, 0, &dir);
        assert!(matches!(result, Err(UploadError::BoundaryNotFound)));
        assert!(!dir.join("lost.bin").exists());
    }

    #[test]
    fn test_leftover_bytes_stay_buffered() {
        // Bytes after the closing delimiter remain for the next part.
        let dir = temp_dir("leftover");
        let req = multipart_request("b4", "--b4", "f.bin", b"payload");
        let (result, conn) = run_extraction(&req, 0, &dir);
        result.unwrap();
        assert_eq!(&conn.buf.filled()[conn.request_len..], b"--");
    }

    #[test]
    fn test_round_trip_reassembly() {
        // Extracted payload + CRLF + delimiter line reproduces the
        // original body bytes between part headers and close.
        let dir = temp_dir("roundtrip");
        let payload = b"round trip payload bytes";
        let req = multipart_request("rt", "--rt", "rt.bin", payload);
        let (result, _) = run_extraction(&req, 4, &dir);
        let upload = result.unwrap();
        let mut content = Vec::new();
        upload.file.take(256).read_to_end(&mut content).unwrap();

        let mut reassembled = content.clone();
        reassembled.extend_from_slice(b"\r\n--rt");
        let needle = &reassembled[..];
        assert!(req
            .windows(needle.len())
            .any(|w| w == needle));
        assert_eq!(content, payload);
    }
}
