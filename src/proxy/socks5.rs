//! SOCKS5 client wire codec.
//!
//! Pure encode/parse helpers with no I/O. Reply parsers return `None`
//! while the reply is still short: a partial reply is never an error,
//! the state machine simply waits for more bytes.

use std::net::SocketAddrV4;

// SOCKS5 protocol constants.
pub const VERSION5: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPT: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACH: u8 = 0x03;
pub const REP_HOST_UNREACH: u8 = 0x04;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Length of the method-selection reply.
pub const METHOD_REPLY_LEN: usize = 2;
/// Length of the CONNECT reply in IPv4 form.
pub const CONNECT_REPLY_LEN: usize = 10;

/// SOCKS5 protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Error {
    /// Peer speaks a different protocol version.
    Version(u8),
    /// The server accepted none of our auth methods.
    NoAcceptableAuth,
    /// The server rejected the CONNECT request with this reply code.
    Rejected(u8),
}

impl std::fmt::Display for Socks5Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Version(v) => write!(f, "unexpected SOCKS version 0x{:02x}", v),
            Self::NoAcceptableAuth => write!(f, "no acceptable auth method"),
            Self::Rejected(code) => write!(f, "connect rejected: {}", reply_name(*code)),
        }
    }
}

impl std::error::Error for Socks5Error {}

fn reply_name(code: u8) -> &'static str {
    match code {
        REP_GENERAL_FAILURE => "general failure",
        REP_NOT_ALLOWED => "not allowed by ruleset",
        REP_NETWORK_UNREACH => "network unreachable",
        REP_HOST_UNREACH => "host unreachable",
        REP_CONN_REFUSED => "connection refused",
        REP_TTL_EXPIRED => "TTL expired",
        REP_CMD_NOT_SUPPORTED => "command not supported",
        REP_ADDR_NOT_SUPPORTED => "address type not supported",
        _ => "unknown reply code",
    }
}

/// The fixed no-authentication greeting: version, one method offered,
/// NO AUTH.
pub fn greeting() -> [u8; 3] {
    [VERSION5, 1, AUTH_NONE]
}

/// Encodes a CONNECT request for an IPv4 target.
pub fn connect_request(target: SocketAddrV4) -> [u8; 10] {
    let ip = target.ip().octets();
    let port = target.port().to_be_bytes();
    [
        VERSION5,
        CMD_CONNECT,
        0x00, // reserved
        ATYP_IPV4,
        ip[0],
        ip[1],
        ip[2],
        ip[3],
        port[0],
        port[1],
    ]
}

/// Parses the 2-byte method-selection reply. `None` while short.
pub fn parse_method_reply(buf: &[u8]) -> Option<Result<(), Socks5Error>> {
    if buf.len() < METHOD_REPLY_LEN {
        return None;
    }
    if buf[0] != VERSION5 {
        return Some(Err(Socks5Error::Version(buf[0])));
    }
    if buf[1] != AUTH_NONE {
        return Some(Err(Socks5Error::NoAcceptableAuth));
    }
    Some(Ok(()))
}

/// Parses the 10-byte CONNECT reply. `None` while short.
pub fn parse_connect_reply(buf: &[u8]) -> Option<Result<(), Socks5Error>> {
    if buf.len() < CONNECT_REPLY_LEN {
        return None;
    }
    if buf[0] != VERSION5 {
        return Some(Err(Socks5Error::Version(buf[0])));
    }
    if buf[1] != REP_SUCCESS {
        return Some(Err(Socks5Error::Rejected(buf[1])));
    }
    Some(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_greeting_bytes() {
        assert_eq!(greeting(), [0x05, 0x01, 0x00]);
    }

    #[test]
    fn test_connect_request_encoding() {
        let target = SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 8443);
        assert_eq!(
            connect_request(target),
            [0x05, 0x01, 0x00, 0x01, 10, 1, 2, 3, 0x20, 0xfb]
        );
    }

    #[test]
    fn test_method_reply_waits_while_short() {
        assert!(parse_method_reply(&[]).is_none());
        assert!(parse_method_reply(&[0x05]).is_none());
        assert_eq!(parse_method_reply(&[0x05, 0x00]), Some(Ok(())));
    }

    #[test]
    fn test_method_reply_rejection() {
        assert_eq!(
            parse_method_reply(&[0x05, AUTH_NO_ACCEPT]),
            Some(Err(Socks5Error::NoAcceptableAuth))
        );
        assert_eq!(
            parse_method_reply(&[0x04, 0x00]),
            Some(Err(Socks5Error::Version(0x04)))
        );
    }

    #[test]
    fn test_connect_reply_waits_while_short() {
        let ok = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        for len in 0..CONNECT_REPLY_LEN {
            assert!(parse_connect_reply(&ok[..len]).is_none(), "len {}", len);
        }
        assert_eq!(parse_connect_reply(&ok), Some(Ok(())));
    }

    #[test]
    fn test_connect_reply_rejection() {
        let refused = [0x05, REP_CONN_REFUSED, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            parse_connect_reply(&refused),
            Some(Err(Socks5Error::Rejected(REP_CONN_REFUSED)))
        );
    }
}
