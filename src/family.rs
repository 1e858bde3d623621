//! Connection-family decoding for the CONN command payload: the 1-byte
//! family tag ('U' unknown, 'L' unix, '4' IPv4, '6' IPv6) followed by an
//! optional port and address. Grounded on the teacher's
//! `MilterMessage::ConnectionInformation` parse arm, generalized to round
//! trip (encode too, for the client side) and to normalize the two IPv6
//! textual forms sendmail/postfix use on the wire.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::WireError;
use crate::wire::{read_cstr, write_cstr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    Unknown,
    Unix,
    Tcp4,
    Tcp6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    pub hostname: String,
    pub family: ProtocolFamily,
    pub port: u16,
    pub address: String,
}

impl ConnInfo {
    pub fn parse(payload: &[u8]) -> Result<Self, WireError> {
        let (hostname, rest) = read_cstr(payload)?;
        let &family_byte = rest.first().ok_or(WireError::Truncated)?;
        let rest = &rest[1..];

        match family_byte {
            b'U' => Ok(ConnInfo {
                hostname,
                family: ProtocolFamily::Unknown,
                port: 0,
                address: String::new(),
            }),
            b'L' => {
                let (path, _) = read_cstr(rest)?;
                Ok(ConnInfo {
                    hostname,
                    family: ProtocolFamily::Unix,
                    port: 0,
                    address: path,
                })
            }
            b'4' => {
                if rest.len() < 2 {
                    return Err(WireError::Truncated);
                }
                let port = u16::from_be_bytes([rest[0], rest[1]]);
                let (addr, _) = read_cstr(&rest[2..])?;
                let parsed: Ipv4Addr = addr.parse().map_err(|_| WireError::Truncated)?;
                Ok(ConnInfo {
                    hostname,
                    family: ProtocolFamily::Tcp4,
                    port,
                    address: parsed.to_string(),
                })
            }
            b'6' => {
                if rest.len() < 2 {
                    return Err(WireError::Truncated);
                }
                let port = u16::from_be_bytes([rest[0], rest[1]]);
                let (addr, _) = read_cstr(&rest[2..])?;
                let normalized = normalize_ipv6(&addr)?;
                Ok(ConnInfo {
                    hostname,
                    family: ProtocolFamily::Tcp6,
                    port,
                    address: normalized,
                })
            }
            other => Err(WireError::UnknownCode(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_cstr(&mut buf, &self.hostname);
        match self.family {
            ProtocolFamily::Unknown => buf.push(b'U'),
            ProtocolFamily::Unix => {
                buf.push(b'L');
                write_cstr(&mut buf, &self.address);
            }
            ProtocolFamily::Tcp4 => {
                buf.push(b'4');
                buf.extend_from_slice(&self.port.to_be_bytes());
                write_cstr(&mut buf, &self.address);
            }
            ProtocolFamily::Tcp6 => {
                buf.push(b'6');
                buf.extend_from_slice(&self.port.to_be_bytes());
                write_cstr(&mut buf, &self.address);
            }
        }
        buf
    }
}

/// Strips a `[bracket]` or `IPv6:` prefix, whichever is present, and
/// canonicalizes through `Ipv6Addr` so `::1`, `[::1]` and `IPv6:::1` all
/// compare equal.
fn normalize_ipv6(raw: &str) -> Result<String, WireError> {
    let trimmed = if let Some(s) = raw.strip_prefix("IPv6:") {
        s
    } else if let Some(s) = raw.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        s
    } else {
        raw
    };
    let addr: Ipv6Addr = trimmed.parse().map_err(|_| WireError::Truncated)?;
    Ok(addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_family_round_trips() {
        let info = ConnInfo {
            hostname: "localhost".into(),
            family: ProtocolFamily::Unix,
            port: 0,
            address: "/var/run/milter.sock".into(),
        };
        let encoded = info.encode();
        let decoded = ConnInfo::parse(&encoded).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn tcp4_family_round_trips() {
        let info = ConnInfo {
            hostname: "mail.example.com".into(),
            family: ProtocolFamily::Tcp4,
            port: 25,
            address: "192.0.2.1".into(),
        };
        let encoded = info.encode();
        let decoded = ConnInfo::parse(&encoded).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn ipv6_bracket_and_prefix_forms_normalize_equal() {
        let mut payload_bracket = Vec::new();
        write_cstr(&mut payload_bracket, "host");
        payload_bracket.push(b'6');
        payload_bracket.extend_from_slice(&25u16.to_be_bytes());
        write_cstr(&mut payload_bracket, "[::1]");

        let mut payload_prefixed = Vec::new();
        write_cstr(&mut payload_prefixed, "host");
        payload_prefixed.push(b'6');
        payload_prefixed.extend_from_slice(&25u16.to_be_bytes());
        write_cstr(&mut payload_prefixed, "IPv6:::1");

        let a = ConnInfo::parse(&payload_bracket).unwrap();
        let b = ConnInfo::parse(&payload_prefixed).unwrap();
        assert_eq!(a.address, b.address);
        assert_eq!(a.address, "::1");
    }

    #[test]
    fn unknown_family_has_no_address_or_port() {
        let mut payload = Vec::new();
        write_cstr(&mut payload, "host");
        payload.push(b'U');
        let info = ConnInfo::parse(&payload).unwrap();
        assert_eq!(info.family, ProtocolFamily::Unknown);
        assert_eq!(info.port, 0);
        assert!(info.address.is_empty());
    }
}
