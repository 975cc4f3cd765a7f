//! HTTP byte-stream layers: request framing, header field scanning, and
//! the streaming multipart upload extractor.

pub mod framing;
pub mod headers;
pub mod upload;
