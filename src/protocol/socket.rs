//! Socket addresses and the connection tuple.

use std::fmt;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::{Error, Result, ValidationError};

/// Size of a `sockaddr_in` structure.
pub const SOCKADDR_IN_LEN: usize = mem::size_of::<libc::sockaddr_in>();

/// Size of a `sockaddr_in6` structure.
pub const SOCKADDR_IN6_LEN: usize = mem::size_of::<libc::sockaddr_in6>();

/// Unique TCP connection, identified by both the source and destination
/// socket addresses.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct ConnTuple {
    /// The source socket address (local IP and port).
    pub src: SocketAddr,
    /// The destination socket address (remote IP and port).
    pub dst: SocketAddr,
}

impl fmt::Display for ConnTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// A socket address parsed from its raw `sockaddr_in`/`sockaddr_in6` form.
///
/// Fields are laid out as on Linux: a native-endian family, the port in
/// network byte order, then the address.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct SockAddr(pub SocketAddr);

impl TryFrom<&[u8]> for SockAddr {
    type Error = Error;

    fn try_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < mem::size_of::<libc::sa_family_t>() {
            return Err(ValidationError::AddressLength {
                provided: buf.len(),
                expected: SOCKADDR_IN_LEN,
            }
            .into());
        }

        let family = libc::sa_family_t::from_ne_bytes([buf[0], buf[1]]) as i32;

        match family {
            libc::AF_INET => {
                if buf.len() != SOCKADDR_IN_LEN {
                    return Err(ValidationError::AddressLength {
                        provided: buf.len(),
                        expected: SOCKADDR_IN_LEN,
                    }
                    .into());
                }

                let port = u16::from_be_bytes([buf[2], buf[3]]);
                let addr = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);

                Ok(SockAddr(SocketAddr::V4(SocketAddrV4::new(addr, port))))
            }
            libc::AF_INET6 => {
                if buf.len() != SOCKADDR_IN6_LEN {
                    return Err(ValidationError::AddressLength {
                        provided: buf.len(),
                        expected: SOCKADDR_IN6_LEN,
                    }
                    .into());
                }

                let port = u16::from_be_bytes([buf[2], buf[3]]);
                let flowinfo = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[8..24]);

                let scope_id = u32::from_ne_bytes([buf[24], buf[25], buf[26], buf[27]]);

                Ok(SockAddr(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flowinfo,
                    scope_id,
                ))))
            }
            _ => Err(ValidationError::UnsupportedFamily.into()),
        }
    }
}

impl From<SockAddr> for SocketAddr {
    fn from(addr: SockAddr) -> SocketAddr {
        addr.0
    }
}

impl SockAddr {
    /// Returns the memory representation of the address in its raw
    /// `sockaddr` layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self.0 {
            SocketAddr::V4(addr) => {
                let mut buf = Vec::with_capacity(SOCKADDR_IN_LEN);
                buf.extend_from_slice(&(libc::AF_INET as libc::sa_family_t).to_ne_bytes());
                buf.extend_from_slice(&addr.port().to_be_bytes());
                buf.extend_from_slice(&addr.ip().octets());
                buf.resize(SOCKADDR_IN_LEN, 0);
                buf
            }
            SocketAddr::V6(addr) => {
                let mut buf = Vec::with_capacity(SOCKADDR_IN6_LEN);
                buf.extend_from_slice(&(libc::AF_INET6 as libc::sa_family_t).to_ne_bytes());
                buf.extend_from_slice(&addr.port().to_be_bytes());
                buf.extend_from_slice(&addr.flowinfo().to_be_bytes());
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.scope_id().to_ne_bytes());
                buf
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_in_parse_valid() {
        let mut raw = vec![0u8; SOCKADDR_IN_LEN];
        raw[..2].copy_from_slice(&(libc::AF_INET as libc::sa_family_t).to_ne_bytes());
        raw[2..4].copy_from_slice(&8080u16.to_be_bytes());
        raw[4..8].copy_from_slice(&[10, 0, 0, 1]);

        let addr = SockAddr::try_from(&raw[..]);
        assert!(addr.is_ok());

        let addr = SocketAddr::from(addr.unwrap());
        assert_eq!(addr, "10.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(SockAddr(addr).to_bytes(), raw);
    }

    #[test]
    fn sockaddr_in6_parse_valid() {
        let addr = SocketAddr::V6(SocketAddrV6::new("fe80::1".parse().unwrap(), 443, 7, 3));
        let raw = SockAddr(addr).to_bytes();

        assert_eq!(raw.len(), SOCKADDR_IN6_LEN);
        assert_eq!(SockAddr::try_from(&raw[..]).unwrap().0, addr);
    }

    #[test]
    fn sockaddr_length_invalid() {
        let mut raw = vec![0u8; SOCKADDR_IN_LEN - 1];
        raw[..2].copy_from_slice(&(libc::AF_INET as libc::sa_family_t).to_ne_bytes());

        let err = SockAddr::try_from(&raw[..]).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn sockaddr_family_invalid() {
        let mut raw = vec![0u8; SOCKADDR_IN_LEN];
        raw[..2].copy_from_slice(&(libc::AF_UNIX as libc::sa_family_t).to_ne_bytes());

        let err = SockAddr::try_from(&raw[..]).unwrap_err();
        assert_eq!(err.errno(), libc::EAFNOSUPPORT);
    }

    #[test]
    fn conn_tuple_display_valid() {
        let tuple = ConnTuple {
            src: "10.0.0.2:12345".parse().unwrap(),
            dst: "10.0.0.1:80".parse().unwrap(),
        };

        assert_eq!(tuple.to_string(), "10.0.0.2:12345 -> 10.0.0.1:80");
    }
}
