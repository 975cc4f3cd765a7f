//! muxnet - embeddable single-threaded connection engine.
//!
//! This crate provides:
//! - `transport`: the pluggable backend contract plus null and
//!   in-memory backends
//! - `net`: the non-blocking TCP backend
//! - `buffer`, `conn`, `io`: per-connection buffering and the
//!   partial-I/O-tolerant pull/push primitives
//! - `http`: request frame detection, header field scanners, and the
//!   streaming multipart upload extractor
//! - `proxy`: the SOCKS5 client wire codec and relay pairing
//! - `manager`: the poll loop that multiplexes it all
//! - `dial`: the blocking one-shot client bootstrap
//!
//! # Example
//!
//! ```rust,ignore
//! use muxnet::{Endpoint, Event, Manager, SocketTransport};
//!
//! let transport = SocketTransport::new()?;
//! let mut mgr = Manager::new(transport);
//! mgr.listen(&Endpoint::parse("0.0.0.0:8080")?)?;
//! loop {
//!     for event in mgr.poll_once(std::time::Duration::from_millis(500))? {
//!         if let Event::RequestReady { conn } = event {
//!             let upload = mgr.receive_upload(conn, "/tmp/uploads".as_ref())?;
//!             println!("stored {}", upload.path.display());
//!         }
//!     }
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod conn;
pub mod dial;
pub mod http;
pub mod io;
pub mod manager;
pub mod net;
pub mod proxy;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use buffer::Buffer;
pub use config::{Config, ConfigError};
pub use conn::{flags, Conn, ConnId, FrameState, SecureChannel};
pub use dial::{dial, fetch, DialError};
pub use http::framing::{detect, scan_request, FrameDetector, Scan};
pub use http::upload::{receive_upload, Upload, UploadError};
pub use io::{pull, pull_quota, push, read_body, Pull, StopFlag};
pub use manager::{Event, Manager, DEFAULT_BUF_CAPACITY};
pub use net::SocketTransport;
pub use proxy::{Advance, Relay, RelayError, RelayState};
pub use transport::{
    Endpoint, Handle, Interest, MemTransport, NullTransport, Readiness, Recv, Transport,
    TransportError,
};
