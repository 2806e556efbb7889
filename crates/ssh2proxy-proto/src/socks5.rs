//! SOCKS5 wire codec (RFC 1928)
//!
//! Decoders work on whatever bytes have been buffered so far and report
//! [`Decoded::Incomplete`] until a full message is available, so the caller
//! owns all I/O. Only the server side of the protocol is implemented.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use thiserror::Error;

pub const VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Socks5Error {
    #[error("Unsupported SOCKS version: {0:#04x}")]
    InvalidVersion(u8),

    #[error("Client offered no authentication methods")]
    NoMethods,

    #[error("Unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("Unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("Invalid domain name in request")]
    InvalidDomain,
}

impl Socks5Error {
    /// The reply code a server should send before dropping the client, if any.
    pub fn reply(&self) -> Option<Reply> {
        match self {
            Socks5Error::UnsupportedAddressType(_) => Some(Reply::AddressTypeNotSupported),
            Socks5Error::UnsupportedCommand(_) => Some(Reply::CommandNotSupported),
            Socks5Error::InvalidDomain => Some(Reply::GeneralFailure),
            Socks5Error::InvalidVersion(_) | Socks5Error::NoMethods => None,
        }
    }
}

/// Outcome of a decode attempt over a partially filled buffer
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<T> {
    /// More bytes are needed
    Incomplete,
    /// A full message and the number of bytes it occupied
    Complete(T, usize),
}

/// Method-selection message sent by the client after connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

impl Greeting {
    pub fn offers(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl Command {
    fn from_byte(byte: u8) -> Result<Self, Socks5Error> {
        match byte {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            other => Err(Socks5Error::UnsupportedCommand(other)),
        }
    }
}

/// Destination of a request, or the bound address of a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// `0.0.0.0:0`, used as the bound address in replies
    pub fn unspecified() -> Self {
        TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
    }

    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(host, _) => host.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            TargetAddr::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            TargetAddr::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            TargetAddr::Domain(host, _) => 1 + 1 + host.len() + 2,
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            TargetAddr::Domain(host, port) => {
                // Domains longer than 255 bytes cannot be represented; truncate
                let bytes = &host.as_bytes()[..host.len().min(255)];
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(bytes.len() as u8);
                buf.put_slice(bytes);
                buf.put_u16(*port);
            }
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub target: TargetAddr,
}

/// Reply codes from RFC 1928 section 6
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

pub fn decode_greeting(buf: &[u8]) -> Result<Decoded<Greeting>, Socks5Error> {
    let Some(&version) = buf.first() else {
        return Ok(Decoded::Incomplete);
    };
    if version != VERSION {
        return Err(Socks5Error::InvalidVersion(version));
    }
    let Some(&count) = buf.get(1) else {
        return Ok(Decoded::Incomplete);
    };
    if count == 0 {
        return Err(Socks5Error::NoMethods);
    }

    let total = 2 + count as usize;
    if buf.len() < total {
        return Ok(Decoded::Incomplete);
    }

    let greeting = Greeting {
        methods: buf[2..total].to_vec(),
    };
    Ok(Decoded::Complete(greeting, total))
}

pub fn decode_request(buf: &[u8]) -> Result<Decoded<Request>, Socks5Error> {
    if buf.len() < 4 {
        if let Some(&version) = buf.first() {
            if version != VERSION {
                return Err(Socks5Error::InvalidVersion(version));
            }
        }
        return Ok(Decoded::Incomplete);
    }

    if buf[0] != VERSION {
        return Err(Socks5Error::InvalidVersion(buf[0]));
    }
    let command = Command::from_byte(buf[1])?;
    // buf[2] is reserved

    let (target, total) = match buf[3] {
        ATYP_IPV4 => {
            let total = 4 + 4 + 2;
            if buf.len() < total {
                return Ok(Decoded::Incomplete);
            }
            let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            let port = u16::from_be_bytes([buf[8], buf[9]]);
            (TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port))), total)
        }
        ATYP_DOMAIN => {
            let Some(&len) = buf.get(4) else {
                return Ok(Decoded::Incomplete);
            };
            if len == 0 {
                return Err(Socks5Error::InvalidDomain);
            }
            let end = 5 + len as usize;
            let total = end + 2;
            if buf.len() < total {
                return Ok(Decoded::Incomplete);
            }
            let host = std::str::from_utf8(&buf[5..end])
                .map_err(|_| Socks5Error::InvalidDomain)?
                .to_string();
            let port = u16::from_be_bytes([buf[end], buf[end + 1]]);
            (TargetAddr::Domain(host, port), total)
        }
        ATYP_IPV6 => {
            let total = 4 + 16 + 2;
            if buf.len() < total {
                return Ok(Decoded::Incomplete);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[4..20]);
            let port = u16::from_be_bytes([buf[20], buf[21]]);
            let addr = SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0);
            (TargetAddr::Ip(SocketAddr::V6(addr)), total)
        }
        other => return Err(Socks5Error::UnsupportedAddressType(other)),
    };

    Ok(Decoded::Complete(Request { command, target }, total))
}

/// Method-selection reply
pub fn encode_method(method: u8) -> [u8; 2] {
    [VERSION, method]
}

/// Command reply carrying `bound` as BND.ADDR/BND.PORT
pub fn encode_reply(reply: Reply, bound: &TargetAddr) -> Bytes {
    let mut buf = BytesMut::with_capacity(3 + bound.encoded_len());
    buf.put_u8(VERSION);
    buf.put_u8(reply as u8);
    buf.put_u8(0x00);
    bound.write_to(&mut buf);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_no_auth() {
        let decoded = decode_greeting(&[0x05, 0x01, 0x00]).unwrap();
        match decoded {
            Decoded::Complete(greeting, used) => {
                assert_eq!(used, 3);
                assert!(greeting.offers(METHOD_NO_AUTH));
            }
            Decoded::Incomplete => panic!("expected a complete greeting"),
        }
    }

    #[test]
    fn test_greeting_partial_and_trailing_bytes() {
        assert_eq!(decode_greeting(&[0x05]).unwrap(), Decoded::Incomplete);
        assert_eq!(decode_greeting(&[0x05, 0x02, 0x00]).unwrap(), Decoded::Incomplete);

        // Request bytes pipelined right behind the greeting are left alone
        let decoded = decode_greeting(&[0x05, 0x02, 0x02, 0x00, 0x05, 0x01]).unwrap();
        assert!(matches!(decoded, Decoded::Complete(_, 4)));
    }

    #[test]
    fn test_greeting_rejects_bad_version() {
        assert_eq!(
            decode_greeting(&[0x04, 0x01, 0x00]),
            Err(Socks5Error::InvalidVersion(0x04))
        );
        assert_eq!(decode_greeting(&[0x05, 0x00]), Err(Socks5Error::NoMethods));
    }

    #[test]
    fn test_connect_ipv4() {
        let bytes = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90];
        let decoded = decode_request(&bytes).unwrap();
        let Decoded::Complete(request, used) = decoded else {
            panic!("expected a complete request");
        };
        assert_eq!(used, 10);
        assert_eq!(request.command, Command::Connect);
        assert_eq!(request.target.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_connect_domain() {
        let mut bytes = vec![0x05, 0x01, 0x00, 0x03, 11];
        bytes.extend_from_slice(b"example.com");
        bytes.extend_from_slice(&443u16.to_be_bytes());

        assert_eq!(decode_request(&bytes[..8]).unwrap(), Decoded::Incomplete);

        let Decoded::Complete(request, used) = decode_request(&bytes).unwrap() else {
            panic!("expected a complete request");
        };
        assert_eq!(used, bytes.len());
        assert_eq!(
            request.target,
            TargetAddr::Domain("example.com".to_string(), 443)
        );
    }

    #[test]
    fn test_connect_ipv6() {
        let mut bytes = vec![0x05, 0x01, 0x00, 0x04];
        bytes.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        bytes.extend_from_slice(&22u16.to_be_bytes());

        let Decoded::Complete(request, _) = decode_request(&bytes).unwrap() else {
            panic!("expected a complete request");
        };
        assert_eq!(request.target.to_string(), "[::1]:22");
        assert_eq!(request.target.host(), "::1");
    }

    #[test]
    fn test_unknown_address_type() {
        let bytes = [0x05, 0x01, 0x00, 0x02, 1, 2, 3, 4, 0, 80];
        let err = decode_request(&bytes).unwrap_err();
        assert_eq!(err, Socks5Error::UnsupportedAddressType(0x02));
        assert_eq!(err.reply(), Some(Reply::AddressTypeNotSupported));
    }

    #[test]
    fn test_unknown_command_and_udp_associate() {
        let err = decode_request(&[0x05, 0x09, 0x00, 0x01]).unwrap_err();
        assert_eq!(err.reply(), Some(Reply::CommandNotSupported));

        let bytes = [0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        let Decoded::Complete(request, _) = decode_request(&bytes).unwrap() else {
            panic!("expected a complete request");
        };
        assert_eq!(request.command, Command::UdpAssociate);
    }

    #[test]
    fn test_empty_domain_is_rejected() {
        let bytes = [0x05, 0x01, 0x00, 0x03, 0, 0, 80];
        assert_eq!(decode_request(&bytes), Err(Socks5Error::InvalidDomain));
    }

    #[test]
    fn test_encode_replies() {
        assert_eq!(encode_method(METHOD_NO_AUTH), [0x05, 0x00]);
        assert_eq!(encode_method(METHOD_NO_ACCEPTABLE), [0x05, 0xFF]);

        let reply = encode_reply(Reply::Succeeded, &TargetAddr::unspecified());
        assert_eq!(&reply[..], &[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let reply = encode_reply(
            Reply::HostUnreachable,
            &TargetAddr::Domain("a.io".to_string(), 80),
        );
        assert_eq!(
            &reply[..],
            &[0x05, 0x04, 0x00, 0x03, 4, b'a', b'.', b'i', b'o', 0x00, 0x50]
        );
    }
}
