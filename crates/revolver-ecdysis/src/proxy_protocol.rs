//! PROXY protocol version 2 preamble.
//!
//! Every proxied connection starts with a binary header telling the backend
//! who the real client is:
//!
//! ```text
//! +------------------+--------+--------+---------+---------------------------+
//! | signature (12 B) | ver/cmd| family | len (BE)| src addr, dst addr, ports |
//! +------------------+--------+--------+---------+---------------------------+
//! ```
//!
//! Only the TCP over IPv4 and TCP over IPv6 families are produced. The
//! decoder additionally understands `LOCAL` headers and skips any TLVs.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::ProxyError;

/// Fixed v2 signature.
pub const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Signature, version/command, family and length.
const FIXED_LEN: usize = 16;

const VERSION_2: u8 = 0x2;
const COMMAND_LOCAL: u8 = 0x0;
const COMMAND_PROXY: u8 = 0x1;

const FAMILY_UNSPEC: u8 = 0x00;
const FAMILY_TCP4: u8 = 0x11;
const FAMILY_TCP6: u8 = 0x21;

const TCP4_ADDRESS_LEN: u16 = 12;
const TCP6_ADDRESS_LEN: u16 = 36;

/// Transport family announced in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Tcp4,
    Tcp6,
}

/// Result of looking for a header at the start of a byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The bytes cannot be the start of a v2 header.
    NotProxy,
    /// More bytes are needed to decide.
    Incomplete,
    /// A complete header occupying the first `consumed` bytes.
    ///
    /// `header` is `None` for `LOCAL` commands and for families that carry
    /// no TCP address.
    Header {
        header: Option<ProxyHeader>,
        consumed: usize,
    },
}

/// Original client address and the address it connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl ProxyHeader {
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// The family the header is encoded with.
    ///
    /// Follows the client address: IPv4 (or IPv4-mapped IPv6) clients get
    /// `Tcp4` unless the destination has no IPv4 form, in which case both
    /// addresses are promoted to IPv6.
    pub fn family(&self) -> AddressFamily {
        match (client_v4(self.source.ip()), listener_v4(self.destination.ip())) {
            (Some(_), Some(_)) => AddressFamily::Tcp4,
            _ => AddressFamily::Tcp6,
        }
    }

    /// Encode as a v2 `PROXY` header.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FIXED_LEN + TCP6_ADDRESS_LEN as usize);
        buf.extend_from_slice(&SIGNATURE);
        buf.push((VERSION_2 << 4) | COMMAND_PROXY);

        match (client_v4(self.source.ip()), listener_v4(self.destination.ip())) {
            (Some(src), Some(dst)) => {
                buf.push(FAMILY_TCP4);
                buf.extend_from_slice(&TCP4_ADDRESS_LEN.to_be_bytes());
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&dst.octets());
            }
            _ => {
                buf.push(FAMILY_TCP6);
                buf.extend_from_slice(&TCP6_ADDRESS_LEN.to_be_bytes());
                buf.extend_from_slice(&to_v6(self.source.ip()).octets());
                buf.extend_from_slice(&to_v6(self.destination.ip()).octets());
            }
        }

        buf.extend_from_slice(&self.source.port().to_be_bytes());
        buf.extend_from_slice(&self.destination.port().to_be_bytes());
        buf
    }

    /// Encode a v2 `LOCAL` header: a connection the proxy made on its own
    /// behalf (health checks), carrying no client address.
    pub fn encode_local() -> Vec<u8> {
        let mut buf = Vec::with_capacity(FIXED_LEN);
        buf.extend_from_slice(&SIGNATURE);
        buf.push((VERSION_2 << 4) | COMMAND_LOCAL);
        buf.push(FAMILY_UNSPEC);
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf
    }

    /// Look for a v2 header at the start of `buf`.
    ///
    /// Fails only when the signature matches but the rest is malformed.
    pub fn decode(buf: &[u8]) -> Result<DecodeOutcome, ProxyError> {
        let prefix = buf.len().min(SIGNATURE.len());
        if buf[..prefix] != SIGNATURE[..prefix] {
            return Ok(DecodeOutcome::NotProxy);
        }
        if buf.len() < FIXED_LEN {
            return Ok(DecodeOutcome::Incomplete);
        }

        let version = buf[12] >> 4;
        let command = buf[12] & 0x0F;
        if version != VERSION_2 {
            return Err(ProxyError::invalid_header(format!(
                "unsupported version {}",
                version
            )));
        }
        if command != COMMAND_LOCAL && command != COMMAND_PROXY {
            return Err(ProxyError::invalid_header(format!(
                "unknown command {:#x}",
                command
            )));
        }

        let family = buf[13];
        let len = u16::from_be_bytes([buf[14], buf[15]]);
        let consumed = FIXED_LEN + len as usize;
        if buf.len() < consumed {
            return Ok(DecodeOutcome::Incomplete);
        }

        if command == COMMAND_LOCAL {
            return Ok(DecodeOutcome::Header {
                header: None,
                consumed,
            });
        }

        let body = &buf[FIXED_LEN..consumed];
        let header = match family {
            FAMILY_TCP4 => {
                if len < TCP4_ADDRESS_LEN {
                    return Err(ProxyError::invalid_header("short TCP4 address block"));
                }
                let src = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let dst = Ipv4Addr::new(body[4], body[5], body[6], body[7]);
                let src_port = u16::from_be_bytes([body[8], body[9]]);
                let dst_port = u16::from_be_bytes([body[10], body[11]]);
                Some(ProxyHeader::new(
                    SocketAddr::from((src, src_port)),
                    SocketAddr::from((dst, dst_port)),
                ))
            }
            FAMILY_TCP6 => {
                if len < TCP6_ADDRESS_LEN {
                    return Err(ProxyError::invalid_header("short TCP6 address block"));
                }
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&body[0..16]);
                dst.copy_from_slice(&body[16..32]);
                let src_port = u16::from_be_bytes([body[32], body[33]]);
                let dst_port = u16::from_be_bytes([body[34], body[35]]);
                Some(ProxyHeader::new(
                    SocketAddr::from((Ipv6Addr::from(src), src_port)),
                    SocketAddr::from((Ipv6Addr::from(dst), dst_port)),
                ))
            }
            // UNSPEC, UDP and UNIX carry nothing usable for a TCP relay.
            _ => None,
        };

        Ok(DecodeOutcome::Header { header, consumed })
    }
}

fn client_v4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

fn listener_v4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) if v6.is_unspecified() => Some(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}
